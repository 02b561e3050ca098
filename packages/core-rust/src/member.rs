//! The seam between the label subsystem and the transport layer.
//!
//! Labels and groups never see a socket. They store trait objects that can
//! report their identity, accept a frame, and answer tag-membership queries.
//! The server crate implements [`Member`] on its connection type; tests
//! implement it on plain structs.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Error returned when a frame cannot be handed to a member.
///
/// Delivery failures are per-recipient and non-fatal: broadcast paths collect
/// the identities of failed members and keep going.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// The member's connection is no longer running.
    #[error("member connection is closed")]
    Closed,
    /// The member's outbound queue is near capacity; the frame was shed.
    #[error("member outbound queue is saturated")]
    Saturated,
}

/// A deliverable endpoint stored inside groups.
///
/// `holds_all` powers inner-join broadcast: the group asks each member
/// whether it carries every tag in the set before delivering, so tag
/// intersections are never materialized globally.
pub trait Member: Send + Sync {
    /// The caller-supplied identity naming this member.
    fn identity(&self) -> &str;

    /// Hands one frame to the member. Must not block.
    ///
    /// # Errors
    ///
    /// Returns [`DeliverError::Closed`] for a dead member and
    /// [`DeliverError::Saturated`] when the frame was shed.
    fn deliver(&self, payload: &Bytes) -> Result<(), DeliverError>;

    /// Whether this member currently holds every tag in `tags`.
    fn holds_all(&self, tags: &[String]) -> bool;
}

/// Shared, clonable member handle as stored by groups.
pub type MemberRef = Arc<dyn Member>;
