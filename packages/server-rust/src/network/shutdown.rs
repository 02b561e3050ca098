//! Graceful shutdown controller with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free health state transitions, an atomic counter
//! with RAII guards for in-flight request tracking, and a
//! `CancellationToken` as the shutdown signal so the broker's root token and
//! the HTTP server observe the same cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Server health state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Server is initializing (not yet accepting requests).
    Starting,
    /// Server is fully operational and accepting requests.
    Ready,
    /// Server is draining in-flight requests (no new requests accepted).
    Draining,
    /// Server has fully stopped (all in-flight requests completed).
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Controls graceful shutdown with health state management and in-flight
/// tracking.
#[derive(Debug)]
pub struct ShutdownController {
    cancel: CancellationToken,
    in_flight: Arc<AtomicU64>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    /// Creates a new shutdown controller in the `Starting` state, tied to
    /// the given cancellation token.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    /// Transitions to the `Ready` state.
    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// A future that resolves when shutdown has been triggered. Each caller
    /// gets an independent wait.
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let cancel = self.cancel.clone();
        async move { cancel.cancelled().await }
    }

    /// Initiates graceful shutdown: `Draining` state, token cancelled.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
        self.cancel.cancel();
    }

    /// Returns the current health state.
    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Creates an RAII guard that tracks an in-flight request.
    ///
    /// The counter is decremented when the guard drops, even if the handler
    /// panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Current number of in-flight requests.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight requests to complete, up to `timeout`.
    ///
    /// Returns `true` on a full drain (state moves to `Stopped`); `false`
    /// if the timeout expired (state remains `Draining`).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
