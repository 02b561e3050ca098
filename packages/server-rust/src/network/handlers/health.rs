//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the server is actually healthy, so monitoring can distinguish
/// "up but draining" from "down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.shutdown.health_state();
    let online = state.broker.online();
    let labels = state.broker.labels_info().len();
    let in_flight = state.shutdown.in_flight_count();
    let uptime_secs = state.start_time.elapsed().as_secs();

    Json(json!({
        "state": health.as_str(),
        "online": online,
        "labels": labels,
        "in_flight": in_flight,
        "uptime_secs": uptime_secs,
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive; a failed probe triggers a restart, so it intentionally
/// ignores broker state.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when ready, 503 otherwise.
///
/// Returns 503 during startup, during graceful shutdown (Draining), and
/// after stop, removing the instance from load-balancer rotation.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
