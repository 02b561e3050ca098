//! Process-wide transfer counters.
//!
//! Connections record sends and sheds; the broker monitor harvests the
//! counters (read-and-reset) once a minute and mirrors them into the
//! `metrics` registry, so the in-process atomics stay cheap on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

/// Snapshot taken by [`TransferStats::harvest`]. Values are deltas since the
/// previous harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub frames_sent: u64,
    pub frames_shed: u64,
    pub bytes_sent: u64,
}

/// Relaxed atomics shared by every connection in the process.
#[derive(Debug, Default)]
pub struct TransferStats {
    frames_sent: AtomicU64,
    frames_shed: AtomicU64,
    bytes_sent: AtomicU64,
}

impl TransferStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one frame successfully written to a socket.
    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records one frame dropped by the shed policy.
    pub fn record_shed(&self) {
        self.frames_shed.fetch_add(1, Ordering::Relaxed);
    }

    /// Current shed count without resetting. Operators use this to watch
    /// weak links between harvests.
    #[must_use]
    pub fn shed(&self) -> u64 {
        self.frames_shed.load(Ordering::Relaxed)
    }

    /// Atomically reads and resets all counters, feeding the deltas into the
    /// `metrics` registry.
    pub fn harvest(&self) -> TransferSnapshot {
        let snapshot = TransferSnapshot {
            frames_sent: self.frames_sent.swap(0, Ordering::Relaxed),
            frames_shed: self.frames_shed.swap(0, Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
        };
        counter!("herd_frames_sent").increment(snapshot.frames_sent);
        counter!("herd_frames_shed").increment(snapshot.frames_shed);
        counter!("herd_bytes_sent").increment(snapshot.bytes_sent);
        snapshot
    }
}
