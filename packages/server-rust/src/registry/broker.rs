//! The process-wide broker: a fixed array of buckets, the label manager,
//! and the public operations.
//!
//! At most one broker exists per process, enforced by a latch that the
//! constructor takes and `Drop` releases. The broker owns the root
//! cancellation token; `stop` cancels it and every supervisory loop
//! (bucket reapers and sweeps, the label runtime, the monitor, the
//! broadcast workers) winds down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use bytes::Bytes;
use http::{HeaderMap, Uri};
use metrics::gauge;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use herd_core::{bucket_index, LabelInfo, LabelManager, MemberRef};

use crate::config::{BrokerConfig, ConnectionConfig};
use crate::error::BrokerError;
use crate::hook::{Discover, Hook, OfflineReason};
use crate::labels::spawn_label_runtime;
use crate::registry::{BroadcastJob, BroadcastQueue, Bucket, Connection, SendJob};
use crate::stats::{TransferSnapshot, TransferStats};

static INSTANCE_LATCH: AtomicBool = AtomicBool::new(false);

const STATUS_STOPPED: u8 = 0;
const STATUS_RUNNING: u8 = 1;

/// How long `stop` waits for in-flight tasks to notice the cancellation.
const STOP_DRAIN: Duration = Duration::from_millis(200);

/// Everything a broker is built from besides the hook.
#[derive(Default)]
pub struct BrokerOptions {
    pub broker: BrokerConfig,
    pub connection: ConnectionConfig,
    pub discover: Option<Arc<dyn Discover>>,
}

/// The broker handle. Clone the `Arc` freely; the underlying instance is
/// unique per process.
pub struct Broker {
    config: BrokerConfig,
    conn_config: ConnectionConfig,
    hook: Arc<dyn Hook>,
    discover: Option<Arc<dyn Discover>>,
    buckets: Vec<Arc<Bucket>>,
    labels: Arc<LabelManager>,
    stats: Arc<TransferStats>,
    online: AtomicI64,
    status: AtomicU8,
    cancel: CancellationToken,
    queue: BroadcastQueue,
}

impl Broker {
    /// Constructs the process's broker. Must run inside a tokio runtime:
    /// bucket reapers and sweeps start immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InstanceExists`] if a broker is already live
    /// in this process.
    pub fn new(hook: Arc<dyn Hook>, options: BrokerOptions) -> Result<Arc<Self>, BrokerError> {
        if INSTANCE_LATCH
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BrokerError::InstanceExists);
        }

        let config = options.broker;
        let cancel = CancellationToken::new();
        let buckets = (0..config.bucket_count.max(1))
            .map(|index| Bucket::new(index, &config, Arc::clone(&hook), cancel.child_token()))
            .collect();

        Ok(Arc::new(Self {
            labels: Arc::new(LabelManager::new(config.label_group_capacity)),
            queue: BroadcastQueue::new(config.broadcast_queue),
            conn_config: options.connection,
            discover: options.discover,
            stats: Arc::new(TransferStats::new()),
            online: AtomicI64::new(0),
            status: AtomicU8::new(STATUS_STOPPED),
            hook,
            buckets,
            cancel,
            config,
        }))
    }

    /// Starts the supervisory tasks and flips the broker to `Running`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AlreadyRunning`] on a second call;
    /// [`BrokerError::NotRunning`] once the broker has been stopped — a
    /// stopped broker does not restart.
    pub fn run(self: &Arc<Self>) -> Result<(), BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::NotRunning);
        }
        if self
            .status
            .compare_exchange(
                STATUS_STOPPED,
                STATUS_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(BrokerError::AlreadyRunning);
        }

        if let Some(discover) = &self.discover {
            discover.register();
        }
        spawn_label_runtime(
            Arc::clone(&self.labels),
            self.cancel.child_token(),
            self.config.label_supervisor_interval,
        );
        tokio::spawn(monitor_loop(Arc::downgrade(self), self.cancel.child_token()));
        if let Some(rx) = self.queue.take_receiver() {
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..self.config.broadcast_workers.max(1) {
                tokio::spawn(broadcast_loop(
                    Arc::downgrade(self),
                    Arc::clone(&rx),
                    self.cancel.child_token(),
                ));
            }
        }
        info!(
            buckets = self.buckets.len(),
            heartbeat = ?self.config.heartbeat_interval,
            "broker running"
        );
        Ok(())
    }

    /// Stops the broker: deregisters from discovery, cancels the root token,
    /// and gives in-flight writes a short drain window.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotRunning`] unless the broker was running.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        if self
            .status
            .compare_exchange(
                STATUS_RUNNING,
                STATUS_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(BrokerError::NotRunning);
        }
        if let Some(discover) = &self.discover {
            discover.deregister();
        }
        self.cancel.cancel();
        tokio::time::sleep(STOP_DRAIN).await;
        info!("broker stopped");
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUNNING
    }

    /// Root cancellation token; the network layer ties its graceful
    /// shutdown to it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validates the upgrade request and hands the socket to the registry.
    ///
    /// The embedder's identification hook runs before the protocol upgrade;
    /// the validate hooks run after, on the live socket.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotRunning`] outside the running state,
    /// [`BrokerError::IdentifyRejected`] when the hook refuses the request.
    pub fn upgrade(
        self: &Arc<Self>,
        ws: WebSocketUpgrade,
        headers: &HeaderMap,
        uri: &Uri,
        remote: Option<SocketAddr>,
    ) -> Result<Response, BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        let identity = self
            .hook
            .identify(headers, uri)
            .map_err(|err| BrokerError::IdentifyRejected(err.to_string()))?;
        if identity.is_empty() {
            return Err(BrokerError::IdentifyRejected(
                "empty identity".to_string(),
            ));
        }
        let broker = Arc::clone(self);
        let ws = ws
            .read_buffer_size(self.conn_config.read_buffer)
            .write_buffer_size(self.conn_config.write_buffer);
        Ok(ws.on_upgrade(move |socket| async move {
            broker.attach(identity, socket, remote).await;
        }))
    }

    /// Registration happens-after the eviction of any prior connection with
    /// the same identity: the old endpoint gets its offline callback and a
    /// farewell grace before the new one enters the bucket.
    async fn attach(self: &Arc<Self>, identity: String, socket: WebSocket, remote: Option<SocketAddr>) {
        let bucket = self.bucket_for(&identity);
        bucket.offline(&identity, OfflineReason::SqueezedOut).await;

        let conn = Connection::spawn(
            identity.clone(),
            socket,
            bucket.signal(),
            &self.conn_config,
            Arc::clone(&self.hook),
            Arc::clone(&self.stats),
            remote,
        );
        match self.hook.validate(&identity).await {
            Ok(()) => self.hook.validate_success(&conn).await,
            Err(err) => {
                // The hook owns the socket's fate from here (farewell frame,
                // close); the connection is never registered.
                self.hook.validate_failed(err, &conn).await;
                return;
            }
        }
        match bucket.register(Arc::clone(&conn)) {
            Ok((bucket_id, online)) => {
                info!(identity = %identity, bucket = %bucket_id, online, "connected");
            }
            Err(err) => {
                let _ = conn.send(Bytes::from(err.to_string()));
                conn.close(false);
            }
        }
    }

    /// Sends a payload to the named identities, or to the whole fleet when
    /// `identities` is empty. Per-bucket async dispatch is used when
    /// configured; a saturated pool falls back to inline delivery.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotRunning`] outside the running state.
    pub fn send(&self, payload: &Bytes, identities: &[String]) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        if identities.is_empty() {
            self.fan_out(payload);
            return Ok(());
        }
        let mut per_bucket: HashMap<usize, Vec<String>> = HashMap::new();
        for identity in identities {
            per_bucket
                .entry(bucket_index(identity, self.buckets.len()))
                .or_default()
                .push(identity.clone());
        }
        for (index, targets) in per_bucket {
            let bucket = &self.buckets[index];
            let job = SendJob {
                payload: payload.clone(),
                targets: Some(targets),
            };
            if let Err(job) = bucket.try_dispatch(job) {
                if let Some(targets) = job.targets {
                    bucket.send(&job.payload, &targets);
                }
            }
        }
        Ok(())
    }

    /// Synchronous whole-fleet broadcast. Returns the identities whose send
    /// failed (weak or closed).
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotRunning`] outside the running state.
    pub fn broadcast_now(&self, payload: &Bytes) -> Result<Vec<String>, BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        let mut failed = Vec::new();
        for bucket in &self.buckets {
            failed.extend(bucket.broadcast(payload));
        }
        Ok(failed)
    }

    /// Asynchronous broadcast through the bounded engine queue.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotRunning`] outside the running state;
    /// [`BrokerError::QueueFull`] above the high-water mark — the caller
    /// sheds.
    pub fn broadcast(&self, job: BroadcastJob) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        self.queue.enqueue(job)
    }

    /// Per-tag payload fan-out. Returns the identities whose send failed.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotRunning`] outside the running state.
    pub fn broadcast_by_label(
        &self,
        frames: &HashMap<String, Bytes>,
    ) -> Result<Vec<String>, BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        Ok(self.labels.broadcast_by_label(frames))
    }

    /// Delivers to connections holding *all* of `tags`, scanning only the
    /// smallest participating label.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotRunning`] outside the running state;
    /// [`BrokerError::Label`] for an empty tag set.
    pub fn broadcast_inner_join(
        &self,
        payload: &Bytes,
        tags: &[String],
    ) -> Result<Vec<String>, BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        Ok(self.labels.broadcast_inner_join(payload, tags)?)
    }

    /// Attaches a connection to a tag and records the membership on the
    /// connection so the reaper can detach it later.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Label`] for an empty tag.
    pub fn label_attach(&self, conn: &Arc<Connection>, tag: &str) -> Result<(), BrokerError> {
        let handle = self
            .labels
            .add(tag, Arc::clone(conn) as MemberRef)?;
        conn.set_tag(tag, handle);
        Ok(())
    }

    /// Detaches a connection from a tag.
    pub fn label_detach(&self, conn: &Arc<Connection>, tag: &str) {
        conn.del_tag(tag);
    }

    /// Snapshot of every label.
    #[must_use]
    pub fn labels_info(&self) -> Vec<LabelInfo> {
        self.labels.list()
    }

    /// Snapshot of one label.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Label`] for an unknown tag.
    pub fn label_info(&self, tag: &str) -> Result<LabelInfo, BrokerError> {
        Ok(self.labels.info(tag)?)
    }

    /// Administratively evicts an identity. The embedder's offline hook
    /// fires with `LogicInitiated`; a missing identity is a no-op.
    pub async fn offline(&self, identity: &str) {
        self.bucket_for(identity)
            .offline(identity, OfflineReason::LogicInitiated)
            .await;
    }

    /// Looks up a live connection by identity.
    #[must_use]
    pub fn connection(&self, identity: &str) -> Option<Arc<Connection>> {
        self.bucket_for(identity).get(identity)
    }

    /// Live online count, summed across buckets.
    #[must_use]
    pub fn online(&self) -> i64 {
        self.buckets.iter().map(|bucket| bucket.count()).sum()
    }

    /// Transfer counter deltas since the last harvest.
    #[must_use]
    pub fn harvest_stats(&self) -> TransferSnapshot {
        self.stats.harvest()
    }

    /// Current shed counter (not reset). Operators watch this between
    /// harvests.
    #[must_use]
    pub fn frames_shed(&self) -> u64 {
        self.stats.shed()
    }

    fn bucket_for(&self, identity: &str) -> &Arc<Bucket> {
        &self.buckets[bucket_index(identity, self.buckets.len())]
    }

    fn fan_out(&self, payload: &Bytes) {
        for bucket in &self.buckets {
            let job = SendJob {
                payload: payload.clone(),
                targets: None,
            };
            if let Err(job) = bucket.try_dispatch(job) {
                let failed = bucket.broadcast(&job.payload);
                if !failed.is_empty() {
                    warn!(bucket = %bucket.id(), shed = failed.len(), "broadcast shed frames");
                }
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.cancel.cancel();
        INSTANCE_LATCH.store(false, Ordering::Release);
    }
}

/// Aggregates bucket counts every 10 seconds; harvests and logs the
/// transfer counters every minute.
async fn monitor_loop(broker: Weak<Broker>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(broker) = broker.upgrade() else { break };
        let online = broker.online();
        broker.online.store(online, Ordering::Relaxed);
        gauge!("herd_online").set(online as f64);

        ticks += 1;
        if ticks % 6 == 0 {
            let snapshot = broker.stats.harvest();
            info!(
                online,
                frames_sent = snapshot.frames_sent,
                frames_shed = snapshot.frames_shed,
                bytes_sent = snapshot.bytes_sent,
                "transfer counters"
            );
        }
    }
}

/// One worker of the broadcast engine pool.
async fn broadcast_loop(
    broker: Weak<Broker>,
    jobs: Arc<Mutex<mpsc::Receiver<BroadcastJob>>>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                () = cancel.cancelled() => return,
                job = jobs.recv() => job,
            }
        };
        let Some(job) = job else { return };
        let Some(broker) = broker.upgrade() else { return };
        match job {
            BroadcastJob::Fleet { payload } => broker.fan_out(&payload),
            BroadcastJob::Labels { frames } => {
                let failed = broker.labels.broadcast_by_label(&frames);
                if !failed.is_empty() {
                    warn!(shed = failed.len(), "label broadcast shed frames");
                }
            }
            BroadcastJob::InnerJoin { payload, tags } => {
                match broker.labels.broadcast_inner_join(&payload, &tags) {
                    Ok(failed) if !failed.is_empty() => {
                        warn!(shed = failed.len(), "inner-join broadcast shed frames");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "inner-join broadcast dropped"),
                }
            }
        }
    }
}
