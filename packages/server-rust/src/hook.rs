//! Embedder-supplied hooks.
//!
//! The broker owns connection plumbing; everything business-shaped is
//! delegated through [`Hook`]: extracting an identity from the upgrade
//! request, authorizing it, reacting to inbound frames, and being told when
//! a connection goes away. An optional [`Discover`] hook ties the broker's
//! lifecycle to an external service registry.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Uri};

use crate::registry::Connection;

/// Why a connection was taken offline by broker logic (as opposed to the
/// socket dying on its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// Displaced by a newer connection with the same identity.
    SqueezedOut,
    /// Administratively evicted by the embedder.
    LogicInitiated,
}

/// Business callbacks, all required.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Extracts the identity from the HTTP upgrade request. Returning an
    /// error rejects the upgrade before any socket work happens.
    ///
    /// # Errors
    ///
    /// Any error aborts the upgrade with the error's message.
    fn identify(&self, headers: &HeaderMap, uri: &Uri) -> anyhow::Result<String>;

    /// Authorizes an identity after the socket is established.
    ///
    /// # Errors
    ///
    /// An error routes through [`Hook::validate_failed`]; the connection is
    /// never registered.
    async fn validate(&self, identity: &str) -> anyhow::Result<()>;

    /// Called when validation rejected the connection. The hook owns the
    /// socket's fate: it may send a farewell frame and must close when done.
    async fn validate_failed(&self, err: anyhow::Error, conn: &Arc<Connection>);

    /// Called when validation accepted the connection, before registration.
    async fn validate_success(&self, conn: &Arc<Connection>);

    /// Called for every inbound data frame.
    async fn handle_receive(&self, conn: &Arc<Connection>, payload: Bytes);

    /// Called when broker logic takes a connection offline.
    async fn offline(&self, conn: &Arc<Connection>, reason: OfflineReason);
}

/// Optional service-registry integration: `register` runs when the broker
/// starts, `deregister` when it stops.
pub trait Discover: Send + Sync {
    fn register(&self);
    fn deregister(&self);
}
