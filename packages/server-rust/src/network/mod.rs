//! The HTTP/WebSocket surface: upgrade route, admin endpoints, middleware,
//! and graceful shutdown control.

pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use handlers::AppState;
pub use module::NetworkModule;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
