//! Bounded newest-wins queue between the capture thread and the send pump.
//!
//! The capture sink must never wait on the network. When the pump falls
//! behind, the oldest pending item is evicted so latency stays bounded by
//! `capacity` frames.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

/// What happened to an item handed to [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after evicting the oldest pending item.
    Evicted,
    /// Discarded because the queue is not open (session not wired yet, or closing).
    Gated,
}

/// Cloneable handle; all clones share the same channel and gate.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    open: Arc<AtomicBool>,
}

impl<T> Clone for OutboundQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            open: Arc::clone(&self.open),
        }
    }
}

impl<T> OutboundQueue<T> {
    /// Create a closed queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start accepting items.
    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Stop accepting items and discard anything pending.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Non-blocking push. Never waits on the consumer.
    pub fn push(&self, item: T) -> PushOutcome {
        if !self.is_open() {
            return PushOutcome::Gated;
        }

        let mut item = item;
        let mut evicted = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    return if evicted {
                        PushOutcome::Evicted
                    } else {
                        PushOutcome::Queued
                    };
                }
                Err(TrySendError::Full(back)) => {
                    // Drop oldest, retry with the newest.
                    let _ = self.rx.try_recv();
                    evicted = true;
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Gated,
            }
        }
    }

    /// Wait up to `timeout` for the next item. `None` on timeout or when closed.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        if !self.is_open() {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_queue_gates_pushes() {
        let q = OutboundQueue::new(2);
        assert_eq!(q.push(1u32), PushOutcome::Gated);
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let q = OutboundQueue::new(2);
        q.open();
        assert_eq!(q.push(1u32), PushOutcome::Queued);
        assert_eq!(q.push(2), PushOutcome::Queued);
        assert_eq!(q.push(3), PushOutcome::Evicted);
        assert_eq!(q.len(), 2);

        let timeout = Duration::from_millis(10);
        assert_eq!(q.pop_timeout(timeout), Some(2));
        assert_eq!(q.pop_timeout(timeout), Some(3));
        assert_eq!(q.pop_timeout(timeout), None);
    }

    #[test]
    fn close_discards_pending_and_stops_delivery() {
        let q = OutboundQueue::new(4);
        q.open();
        q.push("a");
        q.push("b");
        q.close();

        assert!(q.is_empty());
        assert_eq!(q.push("c"), PushOutcome::Gated);
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), None);
    }
}
