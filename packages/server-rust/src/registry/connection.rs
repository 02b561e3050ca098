//! One WebSocket endpoint: framed I/O tasks, bounded send queue, heartbeat
//! stamp, and a close-once path.
//!
//! Exactly one writer task and one reader task run while the connection is
//! `Running`. Both exits funnel through [`Connection::close`], which is
//! guarded by a one-shot latch so racing callers (reader error, writer
//! error, sweep, displacement) produce exactly one socket close and at most
//! one closure notification to the owning bucket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use herd_core::{now_unix, DeliverError, LabelHandle, Member};

use crate::config::{ConnectionConfig, MessageKind};
use crate::error::SendError;
use crate::hook::Hook;
use crate::stats::TransferStats;

const STATUS_RUNNING: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// A write this slow marks the client as a weak link in the logs.
const SLOW_WRITE: Duration = Duration::from_secs(2);

/// One live client endpoint, owned by its bucket from registration until the
/// reaper removes it.
pub struct Connection {
    identity: String,
    outbound: mpsc::Sender<Bytes>,
    heartbeat: AtomicI64,
    status: AtomicU8,
    cancel: CancellationToken,
    closer: mpsc::UnboundedSender<String>,
    kind: MessageKind,
    remote: Option<SocketAddr>,
    tags: Mutex<HashMap<String, LabelHandle>>,
    stats: Arc<TransferStats>,
}

impl Connection {
    /// Builds a connection over an upgraded socket and starts its I/O tasks.
    pub fn spawn(
        identity: String,
        socket: WebSocket,
        closer: mpsc::UnboundedSender<String>,
        config: &ConnectionConfig,
        hook: Arc<dyn Hook>,
        stats: Arc<TransferStats>,
        remote: Option<SocketAddr>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.send_queue.max(1));
        let conn = Arc::new(Self {
            identity,
            outbound: tx,
            heartbeat: AtomicI64::new(now_unix() as i64),
            status: AtomicU8::new(STATUS_RUNNING),
            cancel: CancellationToken::new(),
            closer,
            kind: config.message_kind,
            remote,
            tags: Mutex::new(HashMap::new()),
            stats,
        });

        let (sink, stream) = socket.split();
        tokio::spawn(write_loop(Arc::clone(&conn), sink, rx));
        tokio::spawn(read_loop(Arc::clone(&conn), stream, hook));
        conn
    }

    /// The caller-supplied identity naming this client session.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The peer address, when the transport exposed one.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUNNING
    }

    /// Enqueues one outbound frame without blocking.
    ///
    /// # Errors
    ///
    /// [`SendError::Closed`] when the connection is no longer running;
    /// [`SendError::Weak`] when the queue is past 70% of capacity — the frame
    /// is shed so one slow client cannot stall a fan-out.
    pub fn send(&self, payload: Bytes) -> Result<(), SendError> {
        if !self.is_running() {
            return Err(SendError::Closed);
        }
        let cap = self.outbound.max_capacity();
        let len = cap - self.outbound.capacity();
        if len * 10 > cap * 7 {
            self.stats.record_shed();
            return Err(SendError::Weak);
        }
        match self.outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_shed();
                Err(SendError::Weak)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Stamps the heartbeat with the current wall-clock second.
    pub fn refresh_heartbeat(&self) {
        self.heartbeat.store(now_unix() as i64, Ordering::Relaxed);
    }

    /// Last heartbeat stamp, in Unix seconds.
    #[must_use]
    pub fn last_heartbeat(&self) -> i64 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    /// Closes the connection exactly once: flips the status, cancels both
    /// I/O tasks (the writer sends a close frame on its way out), and
    /// notifies the owning bucket.
    ///
    /// `for_retry` suppresses the bucket notification. It is used when a
    /// newer connection with the same identity is replacing this one, so a
    /// late-running reaper can never delete the replacement's registration.
    pub fn close(&self, for_retry: bool) {
        if self
            .status
            .swap(STATUS_CLOSED, Ordering::AcqRel)
            != STATUS_RUNNING
        {
            return;
        }
        if !for_retry {
            // The reaper may already be gone during shutdown.
            let _ = self.closer.send(self.identity.clone());
        }
        self.cancel.cancel();
        debug!(identity = %self.identity, for_retry, "connection closed");
    }

    /// Records membership in a label. The handle is what the reaper later
    /// uses to detach this identity.
    pub fn set_tag(&self, tag: &str, handle: LabelHandle) {
        self.tags.lock().insert(tag.to_string(), handle);
    }

    /// Drops membership in a label, detaching this identity from it.
    pub fn del_tag(&self, tag: &str) {
        if let Some(handle) = self.tags.lock().remove(tag) {
            handle.delete(&[self.identity.clone()]);
        }
    }

    /// Whether this connection holds every tag in `tags`. O(tags).
    #[must_use]
    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        let held = self.tags.lock();
        tags.iter().all(|tag| held.contains_key(tag))
    }

    /// The tags this connection currently holds.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.tags.lock().keys().cloned().collect()
    }

    /// Detaches this identity from every label it joined. Called by the
    /// bucket reaper after the registry entry is removed.
    pub fn detach_all(&self) {
        let handles: Vec<LabelHandle> = {
            let mut tags = self.tags.lock();
            tags.drain().map(|(_, handle)| handle).collect()
        };
        let identity = [self.identity.clone()];
        for handle in handles {
            handle.delete(&identity);
        }
    }

    fn outbound_frame(&self, payload: &Bytes) -> Message {
        match self.kind {
            MessageKind::Binary => Message::Binary(payload.clone()),
            MessageKind::Text => {
                Message::Text(String::from_utf8_lossy(payload).into_owned().into())
            }
        }
    }

    /// Test constructor without socket tasks: the returned receiver plays
    /// the writer's role.
    #[cfg(test)]
    pub(crate) fn detached(
        identity: &str,
        closer: mpsc::UnboundedSender<String>,
        config: &ConnectionConfig,
        stats: Arc<TransferStats>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(config.send_queue.max(1));
        let conn = Arc::new(Self {
            identity: identity.to_string(),
            outbound: tx,
            heartbeat: AtomicI64::new(now_unix() as i64),
            status: AtomicU8::new(STATUS_RUNNING),
            cancel: CancellationToken::new(),
            closer,
            kind: config.message_kind,
            remote: None,
            tags: Mutex::new(HashMap::new()),
            stats,
        });
        (conn, rx)
    }

    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, secs: i64) {
        self.heartbeat.fetch_sub(secs, Ordering::Relaxed);
    }
}

impl Member for Connection {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn deliver(&self, payload: &Bytes) -> Result<(), DeliverError> {
        self.send(payload.clone()).map_err(Into::into)
    }

    fn holds_all(&self, tags: &[String]) -> bool {
        self.has_all_tags(tags)
    }
}

/// Routes a task exit — normal, error, or panic — through the shared close
/// path, so one dead client never leaves half-open state behind.
struct CloseOnExit(Arc<Connection>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close(false);
    }
}

async fn write_loop(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    let _guard = CloseOnExit(Arc::clone(&conn));
    loop {
        tokio::select! {
            () = conn.cancel.cancelled() => {
                // One farewell tick: flush the close frame if the peer is
                // still there.
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = outbound.recv() => {
                let Some(payload) = frame else { break };
                let started = Instant::now();
                if let Err(err) = sink.send(conn.outbound_frame(&payload)).await {
                    warn!(identity = %conn.identity, %err, "frame write failed");
                    break;
                }
                conn.stats.record_sent(payload.len());
                let spent = started.elapsed();
                if spent > SLOW_WRITE {
                    warn!(identity = %conn.identity, ?spent, "weak link: slow frame write");
                }
            }
        }
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut stream: SplitStream<WebSocket>,
    hook: Arc<dyn Hook>,
) {
    let _guard = CloseOnExit(Arc::clone(&conn));
    loop {
        tokio::select! {
            () = conn.cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(message)) => {
                        conn.refresh_heartbeat();
                        match message {
                            Message::Text(text) => {
                                let payload = Bytes::copy_from_slice(text.as_bytes());
                                hook.handle_receive(&conn, payload).await;
                            }
                            Message::Binary(payload) => {
                                hook.handle_receive(&conn, payload).await;
                            }
                            Message::Ping(_) | Message::Pong(_) => {}
                            Message::Close(_) => break,
                        }
                    }
                    Some(Err(err)) => {
                        debug!(identity = %conn.identity, %err, "frame read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
