//! Herd Server — sharded `WebSocket` connection registry with heartbeat
//! liveness, labeled fan-out, and a bounded broadcast engine.
//!
//! The broker maintains a large population of long-lived client
//! connections across hashed buckets, delivers frames to individual
//! clients, broadcasts to the fleet, and fans out to dynamically-created
//! tag subsets via the label subsystem in `herd-core`. Business concerns
//! (identity extraction, authorization, inbound frames, offline
//! notifications) are delegated to an embedder-supplied [`Hook`].

pub mod config;
pub mod error;
pub mod hook;
mod labels;
pub mod network;
pub mod registry;
pub mod stats;

pub use config::{BrokerConfig, ConnectionConfig, MessageKind, NetworkConfig, TlsConfig};
pub use error::{BrokerError, SendError};
pub use hook::{Discover, Hook, OfflineReason};
pub use network::{AppState, HealthState, NetworkModule, ShutdownController};
pub use registry::{BroadcastJob, Broker, BrokerOptions, Connection};
pub use stats::{TransferSnapshot, TransferStats};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn re_exports_accessible_from_crate_root() {
        let _config = crate::BrokerConfig::default();
        let _kind = crate::MessageKind::Binary;
        let _reason = crate::OfflineReason::SqueezedOut;
    }
}
