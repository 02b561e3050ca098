//! Admin endpoints through which upstream services publish operations:
//! targeted send, fleet broadcast, labeled broadcast, and label inspection.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::error::BrokerError;
use crate::registry::BroadcastJob;

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// Application-opaque payload, handed to the sockets untouched.
    pub payload: String,
    /// Recipients. Empty means the whole fleet.
    #[serde(default)]
    pub identities: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub payload: String,
    /// When present, deliver only to connections holding all of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn reject(err: &BrokerError) -> Response {
    match err {
        BrokerError::NotRunning => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        BrokerError::QueueFull => (StatusCode::TOO_MANY_REQUESTS, err.to_string()).into_response(),
        other => (StatusCode::BAD_REQUEST, other.to_string()).into_response(),
    }
}

/// `POST /v1/send` — deliver a payload to named identities (or everyone).
pub async fn send_handler(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Response {
    let _guard = state.shutdown.in_flight_guard();
    let payload = Bytes::from(request.payload.into_bytes());
    match state.broker.send(&payload, &request.identities) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => reject(&err),
    }
}

/// `POST /v1/broadcast` — enqueue an asynchronous fan-out. With tags this is
/// an inner join over the tag set.
pub async fn broadcast_handler(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Response {
    let _guard = state.shutdown.in_flight_guard();
    let payload = Bytes::from(request.payload.into_bytes());
    let job = if request.tags.is_empty() {
        BroadcastJob::Fleet { payload }
    } else {
        BroadcastJob::InnerJoin {
            payload,
            tags: request.tags,
        }
    };
    match state.broker.broadcast(job) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => reject(&err),
    }
}

/// `POST /v1/labels/broadcast` — one payload per tag, delivered
/// synchronously; responds with the identities whose send failed.
pub async fn label_broadcast_handler(
    State(state): State<AppState>,
    Json(frames): Json<HashMap<String, String>>,
) -> Response {
    let _guard = state.shutdown.in_flight_guard();
    let frames: HashMap<String, Bytes> = frames
        .into_iter()
        .map(|(tag, payload)| (tag, Bytes::from(payload.into_bytes())))
        .collect();
    match state.broker.broadcast_by_label(&frames) {
        Ok(failed) => Json(json!({ "failed": failed })).into_response(),
        Err(err) => reject(&err),
    }
}

/// `GET /v1/labels` — snapshot of every label.
pub async fn labels_handler(State(state): State<AppState>) -> Response {
    Json(state.broker.labels_info()).into_response()
}

/// `GET /v1/labels/{tag}` — snapshot of one label, 404 for unknown tags.
pub async fn label_info_handler(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> Response {
    match state.broker.label_info(&tag) {
        Ok(info) => Json(info).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
