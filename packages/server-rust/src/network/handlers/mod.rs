//! HTTP and WebSocket handler definitions.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod admin;
pub mod health;
pub mod websocket;

pub use admin::{
    broadcast_handler, label_broadcast_handler, label_info_handler, labels_handler, send_handler,
};
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use websocket::ws_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use crate::config::NetworkConfig;
use crate::network::ShutdownController;
use crate::registry::Broker;

/// Shared application state passed to all axum handlers via `State`
/// extraction. Holds `Arc` references so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// The process's broker.
    pub broker: Arc<Broker>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, TLS, CORS, timeout).
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
