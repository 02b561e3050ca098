//! WebSocket upgrade handler.
//!
//! The embedder's identification hook runs against the request parts before
//! the protocol upgrade; a rejected request never reaches the socket layer.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use super::AppState;
use crate::error::BrokerError;

/// Upgrades an HTTP connection to a WebSocket connection and hands it to
/// the broker.
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    match state.broker.upgrade(ws, &headers, &uri, Some(remote)) {
        Ok(response) => response,
        Err(BrokerError::NotRunning) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(err) => (StatusCode::UNAUTHORIZED, err.to_string()).into_response(),
    }
}
