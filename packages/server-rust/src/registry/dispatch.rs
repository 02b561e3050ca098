//! The global async broadcast queue.
//!
//! Producers enqueue one envelope per fan-out; a small worker pool owned by
//! the broker drains the queue. The queue rejects above its high-water mark
//! (80% of capacity) so a producer spike degrades into explicit shedding
//! instead of unbounded latency.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// One asynchronous fan-out. Ownership of the payload transfers to the
/// engine on enqueue.
pub enum BroadcastJob {
    /// Deliver to every connection in every bucket.
    Fleet { payload: Bytes },
    /// Deliver a distinct payload per tag.
    Labels { frames: HashMap<String, Bytes> },
    /// Deliver to connections holding all of `tags`.
    InnerJoin { payload: Bytes, tags: Vec<String> },
}

pub(crate) struct BroadcastQueue {
    tx: mpsc::Sender<BroadcastJob>,
    rx: Mutex<Option<mpsc::Receiver<BroadcastJob>>>,
}

impl BroadcastQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueues a job, rejecting once the queue is more than 80% full.
    ///
    /// # Errors
    ///
    /// [`BrokerError::QueueFull`] — the caller is responsible for shedding.
    pub(crate) fn enqueue(&self, job: BroadcastJob) -> Result<(), BrokerError> {
        let cap = self.tx.max_capacity();
        let len = cap - self.tx.capacity();
        if len * 10 > cap * 8 {
            return Err(BrokerError::QueueFull);
        }
        self.tx.try_send(job).map_err(|_| BrokerError::QueueFull)
    }

    /// Hands the consumer side to the worker pool. Yields `None` after the
    /// first call.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<BroadcastJob>> {
        self.rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> BroadcastJob {
        BroadcastJob::Fleet {
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn enqueue_rejects_past_high_water_mark() {
        let queue = BroadcastQueue::new(10);
        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..10 {
            match queue.enqueue(fleet()) {
                Ok(()) => accepted += 1,
                Err(BrokerError::QueueFull) => rejected += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(accepted, 9);
        assert_eq!(rejected, 1);
    }

    #[test]
    fn receiver_is_taken_once() {
        let queue = BroadcastQueue::new(4);
        assert!(queue.take_receiver().is_some());
        assert!(queue.take_receiver().is_none());
    }

    #[tokio::test]
    async fn enqueued_jobs_reach_the_receiver() {
        let queue = BroadcastQueue::new(4);
        let mut rx = queue.take_receiver().expect("receiver");
        queue.enqueue(fleet()).expect("enqueue");
        assert!(matches!(
            rx.recv().await,
            Some(BroadcastJob::Fleet { .. })
        ));
    }
}
