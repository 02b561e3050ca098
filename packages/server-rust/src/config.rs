//! Broker, connection, and network configuration types.

use std::path::PathBuf;
use std::time::Duration;

use herd_core::DEFAULT_GROUP_CAPACITY;

/// WebSocket frame kind used for outbound payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text frames. Invalid UTF-8 payloads are lossily converted.
    Text,
    /// Raw binary frames.
    Binary,
}

/// Registry-wide broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Expected client heartbeat period. The reaper closes connections
    /// silent for more than twice this.
    pub heartbeat_interval: Duration,
    /// Number of registry shards. A power of two gets the cheap mask route.
    pub bucket_count: usize,
    /// Initial identity-map capacity per shard.
    pub bucket_size: usize,
    /// Per-shard async send-dispatch queue depth. Zero disables the queue
    /// and fan-out runs inline.
    pub bucket_buffer: usize,
    /// Workers draining each shard's send-dispatch queue.
    pub bucket_send_workers: usize,
    /// Per-group member capacity inside labels.
    pub label_group_capacity: usize,
    /// How often the label supervisor scans for structural work.
    pub label_supervisor_interval: Duration,
    /// How often each shard sweeps for stale heartbeats.
    pub sweep_interval: Duration,
    /// Global async broadcast queue depth.
    pub broadcast_queue: usize,
    /// Workers draining the global broadcast queue.
    pub broadcast_workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(120),
            bucket_count: 16,
            bucket_size: 512,
            bucket_buffer: 32,
            bucket_send_workers: 4,
            label_group_capacity: DEFAULT_GROUP_CAPACITY,
            label_supervisor_interval: Duration::from_secs(20),
            sweep_interval: Duration::from_secs(10),
            broadcast_queue: 200,
            broadcast_workers: 10,
        }
    }
}

/// Per-connection configuration controlling backpressure and framing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound frame queue capacity. Sends are shed once the queue passes
    /// 70% of this, so slow clients never block the fleet.
    pub send_queue: usize,
    /// WebSocket read buffer size in bytes.
    pub read_buffer: usize,
    /// WebSocket write buffer size in bytes.
    pub write_buffer: usize,
    /// Frame kind for outbound payloads.
    pub message_kind: MessageKind,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue: 8,
            read_buffer: 1024,
            write_buffer: 1024,
            message_kind: MessageKind::Text,
        }
    }
}

/// Top-level network configuration for the HTTP/WS surface.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for an admin request to complete.
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file.
    pub cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub key_path: PathBuf,
}
