//! The label lifecycle runtime.
//!
//! Two tasks: a supervisor that scans every label on a fixed period and
//! classifies the structural work, and a single worker that applies it.
//! Running every structural mutation on one worker serializes label
//! reorganization against itself; adds and broadcasts stay concurrent
//! because each label's own lock covers them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use herd_core::{Label, LabelManager, LifecycleEvent};

/// Bound of each lifecycle channel. A full channel drops the event; the
/// next supervisor pass re-emits it.
const LIFECYCLE_CHANNEL: usize = 5;

pub(crate) fn spawn_label_runtime(
    labels: Arc<LabelManager>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let (expand_tx, expand_rx) = mpsc::channel::<Arc<Label>>(LIFECYCLE_CHANNEL);
    let (shrink_tx, shrink_rx) = mpsc::channel::<Arc<Label>>(LIFECYCLE_CHANNEL);
    let (balance_tx, balance_rx) = mpsc::channel::<Arc<Label>>(LIFECYCLE_CHANNEL);

    tokio::spawn(supervisor_loop(
        labels,
        cancel.clone(),
        interval,
        expand_tx,
        shrink_tx,
        balance_tx,
    ));
    tokio::spawn(worker_loop(cancel, expand_rx, shrink_rx, balance_rx));
}

async fn supervisor_loop(
    labels: Arc<LabelManager>,
    cancel: CancellationToken,
    interval: Duration,
    expand: mpsc::Sender<Arc<Label>>,
    shrink: mpsc::Sender<Arc<Label>>,
    balance: mpsc::Sender<Arc<Label>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for event in labels.scan() {
            let dropped = match event {
                LifecycleEvent::Expand(label) => expand.try_send(label).is_err(),
                LifecycleEvent::Shrink(label) => shrink.try_send(label).is_err(),
                LifecycleEvent::Rebalance(label) => balance.try_send(label).is_err(),
            };
            if dropped {
                debug!("lifecycle channel full; event re-emitted next pass");
            }
        }
    }
}

async fn worker_loop(
    cancel: CancellationToken,
    mut expand: mpsc::Receiver<Arc<Label>>,
    mut shrink: mpsc::Receiver<Arc<Label>>,
    mut balance: mpsc::Receiver<Arc<Label>>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            label = expand.recv() => match label {
                Some(label) => label.expansion(),
                None => break,
            },
            label = shrink.recv() => match label {
                Some(label) => label.shrinks(),
                None => break,
            },
            label = balance.recv() => match label {
                Some(label) => label.balance(),
                None => break,
            },
        }
    }
}
