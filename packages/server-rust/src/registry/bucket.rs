//! One shard of the connection registry.
//!
//! A bucket owns the connections whose identities hash to it. Its lock
//! protects only the identity map; nothing that can block on a connection's
//! outbound queue runs under it (sends are non-blocking `try_send`s).
//! Two tasks run per bucket: the reaper, draining the closure-notifier
//! channel, and the heartbeat sweep. An optional worker pool turns fan-out
//! into asynchronous dispatch when `bucket_buffer` is configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use herd_core::now_unix;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::hook::{Hook, OfflineReason};
use crate::registry::Connection;

/// Grace between the offline callback and the physical close, giving the
/// writer one last tick to flush a farewell frame.
const FAREWELL_GRACE: Duration = Duration::from_millis(50);

/// A unit of asynchronous fan-out work. No targets means the whole bucket.
pub(crate) struct SendJob {
    pub payload: Bytes,
    pub targets: Option<Vec<String>>,
}

pub(crate) struct Bucket {
    id: String,
    map: RwLock<HashMap<String, Arc<Connection>>>,
    online: AtomicI64,
    closer: mpsc::UnboundedSender<String>,
    dispatch: Option<mpsc::Sender<SendJob>>,
    cancel: CancellationToken,
    hook: Arc<dyn Hook>,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
}

impl Bucket {
    pub(crate) fn new(
        index: usize,
        config: &BrokerConfig,
        hook: Arc<dyn Hook>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (closer_tx, closer_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = if config.bucket_buffer > 0 {
            let (tx, rx) = mpsc::channel(config.bucket_buffer);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let bucket = Arc::new(Self {
            id: format!("bucket-{index}"),
            map: RwLock::new(HashMap::with_capacity(config.bucket_size)),
            online: AtomicI64::new(0),
            closer: closer_tx,
            dispatch: dispatch_tx,
            cancel,
            hook,
            heartbeat_interval: config.heartbeat_interval,
            sweep_interval: config.sweep_interval,
        });

        tokio::spawn(reap_loop(Arc::clone(&bucket), closer_rx));
        tokio::spawn(sweep_loop(Arc::clone(&bucket)));
        if let Some(rx) = dispatch_rx {
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..config.bucket_send_workers.max(1) {
                tokio::spawn(dispatch_loop(Arc::clone(&bucket), Arc::clone(&rx)));
            }
        }
        bucket
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// The write side of the closure-notifier channel, handed to every
    /// connection at construction.
    pub(crate) fn signal(&self) -> mpsc::UnboundedSender<String> {
        self.closer.clone()
    }

    /// Online count for this shard.
    pub(crate) fn count(&self) -> i64 {
        self.online.load(Ordering::Relaxed)
    }

    pub(crate) fn get(&self, identity: &str) -> Option<Arc<Connection>> {
        self.map.read().get(identity).cloned()
    }

    /// Inserts a connection, displacing any older one with the same
    /// identity. The displaced connection is closed with its closure
    /// notification suppressed, so the reaper cannot race the replacement
    /// out of the map; the online count is unchanged by a replacement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotRunning`] once shutdown has begun.
    pub(crate) fn register(
        &self,
        conn: Arc<Connection>,
    ) -> Result<(String, i64), BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::NotRunning);
        }
        let identity = conn.identity().to_string();
        let displaced = self.map.write().insert(identity, conn);
        match displaced {
            Some(old) => old.close(true),
            None => {
                self.online.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok((self.id.clone(), self.online.load(Ordering::Relaxed)))
    }

    /// Takes a connection offline for a business reason: the embedder is
    /// notified first, then a short grace lets the writer flush a farewell
    /// frame before the physical close. Missing identities are a no-op.
    pub(crate) async fn offline(&self, identity: &str, reason: OfflineReason) {
        let Some(conn) = self.get(identity) else {
            return;
        };
        self.hook.offline(&conn, reason).await;
        tokio::time::sleep(FAREWELL_GRACE).await;
        conn.close(false);
    }

    /// Sends a payload to the named identities. Send-to-missing is not an
    /// error, and per-connection failures are logged, never propagated.
    pub(crate) fn send(&self, payload: &Bytes, identities: &[String]) {
        for identity in identities {
            let Some(conn) = self.get(identity) else {
                continue;
            };
            if let Err(err) = conn.send(payload.clone()) {
                debug!(identity = %identity, %err, "targeted send dropped");
            }
        }
    }

    /// Fans a payload out to every connection in the shard, returning the
    /// identities whose send failed.
    pub(crate) fn broadcast(&self, payload: &Bytes) -> Vec<String> {
        let map = self.map.read();
        let mut failed = Vec::new();
        for (identity, conn) in map.iter() {
            if conn.send(payload.clone()).is_err() {
                failed.push(identity.clone());
            }
        }
        failed
    }

    /// Hands a job to the async dispatch pool. The job comes back when the
    /// pool is absent or saturated so the caller can run it inline.
    pub(crate) fn try_dispatch(&self, job: SendJob) -> Result<(), SendJob> {
        match &self.dispatch {
            Some(tx) => tx.try_send(job).map_err(|err| match err {
                mpsc::error::TrySendError::Full(job)
                | mpsc::error::TrySendError::Closed(job) => job,
            }),
            None => Err(job),
        }
    }

    /// Removes a reported identity from the map, but only if its connection
    /// has actually stopped running: a late notification must never evict a
    /// newer connection that re-registered the same identity.
    fn reap(&self, identity: &str) {
        let removed = {
            let mut map = self.map.write();
            match map.get(identity) {
                Some(conn) if !conn.is_running() => map.remove(identity),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            self.online.fetch_sub(1, Ordering::Relaxed);
            conn.detach_all();
            debug!(identity = %identity, bucket = %self.id, "connection reaped");
        }
    }

    /// One heartbeat sweep: snapshot the stale set under the read lock,
    /// close outside it.
    pub(crate) fn sweep_once(&self) {
        let threshold = 2 * self.heartbeat_interval.as_secs() as i64;
        let now = now_unix() as i64;
        let stale: Vec<Arc<Connection>> = {
            self.map
                .read()
                .values()
                .filter(|conn| now - conn.last_heartbeat() > threshold)
                .cloned()
                .collect()
        };
        for conn in stale {
            warn!(identity = %conn.identity(), bucket = %self.id, "closing stale connection");
            conn.close(false);
        }
    }
}

async fn reap_loop(bucket: Arc<Bucket>, mut closer: mpsc::UnboundedReceiver<String>) {
    loop {
        tokio::select! {
            () = bucket.cancel.cancelled() => break,
            identity = closer.recv() => {
                let Some(identity) = identity else { break };
                bucket.reap(&identity);
            }
        }
    }
}

async fn sweep_loop(bucket: Arc<Bucket>) {
    let mut ticker = tokio::time::interval(bucket.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = bucket.cancel.cancelled() => break,
            _ = ticker.tick() => bucket.sweep_once(),
        }
    }
}

async fn dispatch_loop(bucket: Arc<Bucket>, jobs: Arc<Mutex<mpsc::Receiver<SendJob>>>) {
    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                () = bucket.cancel.cancelled() => return,
                job = jobs.recv() => job,
            }
        };
        let Some(job) = job else { return };
        match job.targets {
            Some(targets) => bucket.send(&job.payload, &targets),
            None => {
                let _ = bucket.broadcast(&job.payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::registry::testhook::RecordingHook;
    use crate::stats::TransferStats;

    fn bucket_with(config: &BrokerConfig) -> (Arc<Bucket>, Arc<RecordingHook>) {
        let hook = RecordingHook::shared();
        let bucket = Bucket::new(
            0,
            config,
            Arc::clone(&hook) as Arc<dyn Hook>,
            CancellationToken::new(),
        );
        (bucket, hook)
    }

    fn conn_on(
        bucket: &Bucket,
        identity: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        Connection::detached(
            identity,
            bucket.signal(),
            &ConnectionConfig::default(),
            Arc::new(TransferStats::new()),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(check(), "condition not reached in time");
    }

    #[tokio::test]
    async fn register_counts_distinct_identities() {
        let (bucket, _) = bucket_with(&BrokerConfig::default());
        let (alice, _alice_rx) = conn_on(&bucket, "alice");
        let (_, online) = bucket.register(alice).expect("register");
        assert_eq!(online, 1);
        let (bob, _bob_rx) = conn_on(&bucket, "bob");
        let (_, online) = bucket.register(bob).expect("register");
        assert_eq!(online, 2);
        assert_eq!(bucket.count(), 2);
    }

    #[tokio::test]
    async fn register_replacement_closes_old_and_keeps_count() {
        let (bucket, _) = bucket_with(&BrokerConfig::default());
        let (first, _first_rx) = conn_on(&bucket, "bob");
        bucket.register(Arc::clone(&first)).expect("register");
        let (second, _second_rx) = conn_on(&bucket, "bob");
        let (_, online) = bucket.register(Arc::clone(&second)).expect("register");

        assert_eq!(online, 1);
        assert!(!first.is_running());
        assert!(second.is_running());

        // The displaced close was suppressed, so the replacement survives
        // any reaper activity.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bucket.count(), 1);
        assert!(bucket.get("bob").expect("entry").is_running());
    }

    #[tokio::test]
    async fn closed_connection_is_reaped() {
        let (bucket, _) = bucket_with(&BrokerConfig::default());
        let (conn, _conn_rx) = conn_on(&bucket, "alice");
        bucket.register(Arc::clone(&conn)).expect("register");
        conn.close(false);
        wait_until(|| bucket.count() == 0).await;
        assert!(bucket.get("alice").is_none());
    }

    #[tokio::test]
    async fn stale_notification_spares_running_connection() {
        let (bucket, _) = bucket_with(&BrokerConfig::default());
        let (bob, _bob_rx) = conn_on(&bucket, "bob");
        bucket.register(bob).expect("register");

        // A notification for a running identity is a leftover from a
        // displaced predecessor; it must not evict the live entry.
        bucket.signal().send("bob".to_string()).expect("signal");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bucket.count(), 1);
        assert!(bucket.get("bob").expect("entry").is_running());
    }

    #[tokio::test]
    async fn offline_notifies_hook_then_closes() {
        let (bucket, hook) = bucket_with(&BrokerConfig::default());
        let (conn, _conn_rx) = conn_on(&bucket, "bob");
        bucket.register(Arc::clone(&conn)).expect("register");

        bucket.offline("bob", OfflineReason::SqueezedOut).await;
        assert!(!conn.is_running());
        assert_eq!(
            hook.offline_events(),
            vec![("bob".to_string(), OfflineReason::SqueezedOut)]
        );
    }

    #[tokio::test]
    async fn offline_missing_identity_is_noop() {
        let (bucket, hook) = bucket_with(&BrokerConfig::default());
        bucket.offline("ghost", OfflineReason::LogicInitiated).await;
        assert!(hook.offline_events().is_empty());
    }

    #[tokio::test]
    async fn send_to_missing_identity_is_not_an_error() {
        let (bucket, _) = bucket_with(&BrokerConfig::default());
        bucket.send(&Bytes::from_static(b"x"), &["ghost".to_string()]);
    }

    #[tokio::test]
    async fn broadcast_reports_weak_links() {
        let (bucket, _) = bucket_with(&BrokerConfig::default());
        let (healthy, _healthy_rx) = conn_on(&bucket, "healthy");
        let (stuck, _stuck_rx) = conn_on(&bucket, "stuck");
        bucket.register(Arc::clone(&healthy)).expect("register");
        bucket.register(Arc::clone(&stuck)).expect("register");

        // Saturate the stuck connection's queue past the shed threshold.
        for _ in 0..8 {
            let _ = stuck.send(Bytes::from_static(b"fill"));
        }

        let failed = bucket.broadcast(&Bytes::from_static(b"hello"));
        assert_eq!(failed, vec!["stuck".to_string()]);
    }

    #[tokio::test]
    async fn sweep_closes_stale_connections() {
        let config = BrokerConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..BrokerConfig::default()
        };
        let (bucket, _) = bucket_with(&config);
        let (stale, _stale_rx) = conn_on(&bucket, "stale");
        let (fresh, _fresh_rx) = conn_on(&bucket, "fresh");
        bucket.register(Arc::clone(&stale)).expect("register");
        bucket.register(Arc::clone(&fresh)).expect("register");

        stale.backdate_heartbeat(25);
        bucket.sweep_once();

        assert!(!stale.is_running());
        assert!(fresh.is_running());
        wait_until(|| bucket.count() == 1).await;
    }

    #[tokio::test]
    async fn register_fails_after_shutdown() {
        let cancel = CancellationToken::new();
        let bucket = Bucket::new(
            0,
            &BrokerConfig::default(),
            RecordingHook::shared() as Arc<dyn Hook>,
            cancel.clone(),
        );
        cancel.cancel();
        let (late, _late_rx) = conn_on(&bucket, "late");
        let err = bucket.register(late).unwrap_err();
        assert_eq!(err, BrokerError::NotRunning);
    }

    #[tokio::test]
    async fn dispatch_pool_delivers_jobs() {
        let config = BrokerConfig {
            bucket_buffer: 8,
            bucket_send_workers: 2,
            ..BrokerConfig::default()
        };
        let (bucket, _) = bucket_with(&config);
        let (conn, mut outbound) = Connection::detached(
            "alice",
            bucket.signal(),
            &ConnectionConfig::default(),
            Arc::new(TransferStats::new()),
        );
        bucket.register(conn).expect("register");

        bucket
            .try_dispatch(SendJob {
                payload: Bytes::from_static(b"queued"),
                targets: Some(vec!["alice".to_string()]),
            })
            .map_err(|_| "queue refused the job")
            .expect("dispatch accepted");

        let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .expect("dispatch timely")
            .expect("frame");
        assert_eq!(frame, "queued");
    }

    #[tokio::test]
    async fn try_dispatch_returns_job_without_pool() {
        let config = BrokerConfig {
            bucket_buffer: 0,
            ..BrokerConfig::default()
        };
        let (bucket, _) = bucket_with(&config);
        let job = SendJob {
            payload: Bytes::from_static(b"x"),
            targets: None,
        };
        assert!(bucket.try_dispatch(job).is_err());
    }
}
