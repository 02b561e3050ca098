//! The sharded connection registry: connections, buckets, routing, and the
//! broker that ties them together.

mod broker;
mod bucket;
mod connection;
mod dispatch;

pub use broker::{Broker, BrokerOptions};
pub use connection::Connection;
pub use dispatch::BroadcastJob;

pub(crate) use bucket::{Bucket, SendJob};
pub(crate) use dispatch::BroadcastQueue;

#[cfg(test)]
pub(crate) mod testhook {
    //! A recording hook plus the serialization lock broker tests share.
    //!
    //! The broker enforces at-most-one instance per process, so every test
    //! that constructs one must hold [`serial`] for its duration.

    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, Uri};
    use parking_lot::{Mutex, MutexGuard};

    use crate::hook::{Hook, OfflineReason};
    use crate::registry::Connection;

    static BROKER_SERIAL: Mutex<()> = Mutex::new(());

    /// Serializes tests that construct a broker.
    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        BROKER_SERIAL.lock()
    }

    /// Hook that records every callback and rejects identities starting
    /// with `deny`.
    #[derive(Default)]
    pub(crate) struct RecordingHook {
        offline: Mutex<Vec<(String, OfflineReason)>>,
        received: Mutex<Vec<(String, Bytes)>>,
        rejected: Mutex<Vec<String>>,
        accepted: Mutex<Vec<String>>,
    }

    impl RecordingHook {
        pub(crate) fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn offline_events(&self) -> Vec<(String, OfflineReason)> {
            self.offline.lock().clone()
        }

        pub(crate) fn received(&self) -> Vec<(String, Bytes)> {
            self.received.lock().clone()
        }

        pub(crate) fn rejected(&self) -> Vec<String> {
            self.rejected.lock().clone()
        }

        pub(crate) fn accepted(&self) -> Vec<String> {
            self.accepted.lock().clone()
        }
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn identify(&self, _headers: &HeaderMap, uri: &Uri) -> anyhow::Result<String> {
            for pair in uri.query().unwrap_or_default().split('&') {
                if let Some(token) = pair.strip_prefix("token=") {
                    if !token.is_empty() {
                        return Ok(token.to_string());
                    }
                }
            }
            anyhow::bail!("missing token")
        }

        async fn validate(&self, identity: &str) -> anyhow::Result<()> {
            if identity.starts_with("deny") {
                anyhow::bail!("identity {identity} is not allowed")
            }
            Ok(())
        }

        async fn validate_failed(&self, _err: anyhow::Error, conn: &Arc<Connection>) {
            self.rejected.lock().push(conn.identity().to_string());
            conn.close(false);
        }

        async fn validate_success(&self, conn: &Arc<Connection>) {
            self.accepted.lock().push(conn.identity().to_string());
        }

        async fn handle_receive(&self, conn: &Arc<Connection>, payload: Bytes) {
            self.received
                .lock()
                .push((conn.identity().to_string(), payload));
        }

        async fn offline(&self, conn: &Arc<Connection>, reason: OfflineReason) {
            self.offline
                .lock()
                .push((conn.identity().to_string(), reason));
        }
    }
}
