//! Error types for the broker surface.
//!
//! Lifecycle misuse and queue rejection are reported to the caller; socket
//! I/O failures never surface here, they feed the connection's shared close
//! path instead.

use thiserror::Error;

use herd_core::DeliverError;

/// Errors returned by the broker's public operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// A broker already exists in this process; at most one may be live.
    #[error("a broker instance already exists in this process")]
    InstanceExists,
    /// The operation requires a running broker.
    #[error("broker is not running")]
    NotRunning,
    /// `run` was called on a broker that is already running.
    #[error("broker is already running")]
    AlreadyRunning,
    /// The async broadcast queue is above its high-water mark; the caller is
    /// responsible for shedding.
    #[error("broadcast queue is full")]
    QueueFull,
    /// The embedder's identification hook rejected the upgrade request.
    #[error("identify rejected: {0}")]
    IdentifyRejected(String),
    /// Structural label error surfaced to the caller.
    #[error(transparent)]
    Label(#[from] herd_core::LabelError),
}

/// Errors returned by the per-connection send path.
///
/// Both are shed decisions: the frame is dropped, `frames_shed` is bumped,
/// and the caller decides whether the recipient matters.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection is no longer running.
    #[error("connection is closed")]
    Closed,
    /// The outbound queue is past the shed threshold; the connection is
    /// treated as a weak link to protect the fleet.
    #[error("connection is weak")]
    Weak,
}

impl From<SendError> for DeliverError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Closed => DeliverError::Closed,
            SendError::Weak => DeliverError::Saturated,
        }
    }
}
