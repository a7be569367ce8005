//! In-process transport. The "remote" is a [`RemoteEnd`] handle the caller
//! drives directly: push inbound events, read what the session sent.
//!
//! Used by tests and by embedders that bridge to a transport of their own.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ConnectConfig, ConnectFuture, Connection, Connector, Delivery, Transport, TransportEvent,
};
use crate::{
    codec::EncodedChunk,
    error::{Result, VoxError},
};

#[derive(Default)]
struct Plan {
    failures: VecDeque<String>,
    delay: Option<Duration>,
}

/// Connector whose connections stay inside the process.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    plan: Arc<Mutex<Plan>>,
    remotes: Arc<Mutex<VecDeque<RemoteEnd>>>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `connect` fail with `ConnectFailed(reason)`.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.plan.lock().failures.push_back(reason.into());
    }

    /// Delay every subsequent `connect` by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.plan.lock().delay = delay;
    }

    /// Number of `connect` calls so far, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Oldest established connection not yet taken.
    pub fn take_remote(&self) -> Option<RemoteEnd> {
        self.remotes.lock().pop_front()
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("attempts", &self.connect_count())
            .finish_non_exhaustive()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, config: &ConnectConfig) -> ConnectFuture {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (failure, delay) = {
            let mut plan = self.plan.lock();
            (plan.failures.pop_front(), plan.delay)
        };
        let config = config.clone();
        let remotes = Arc::clone(&self.remotes);

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(reason) = failure {
                return Err(VoxError::ConnectFailed(reason));
            }

            let (event_tx, event_rx) = mpsc::channel(config.inbound_capacity.max(1));
            let (sent_tx, sent_rx) = unbounded();
            let closed = Arc::new(AtomicBool::new(false));

            let transport = Arc::new(MemoryTransport {
                sent: sent_tx,
                closed: Arc::clone(&closed),
            });
            remotes.lock().push_back(RemoteEnd {
                events: event_tx,
                sent: sent_rx,
                closed,
                config,
            });
            debug!("memory connection established");

            Ok(Connection {
                transport,
                events: event_rx,
            })
        })
    }
}

/// Outbound half handed to the session.
pub struct MemoryTransport {
    sent: Sender<EncodedChunk>,
    closed: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn send(&self, chunk: EncodedChunk) -> Result<Delivery> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VoxError::SendFailed("transport closed".into()));
        }
        self.sent
            .send(chunk)
            .map(|()| Delivery::Queued)
            .map_err(|_| VoxError::SendFailed("remote end dropped".into()))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// The far side of a memory connection.
pub struct RemoteEnd {
    events: mpsc::Sender<TransportEvent>,
    sent: Receiver<EncodedChunk>,
    closed: Arc<AtomicBool>,
    config: ConnectConfig,
}

impl RemoteEnd {
    /// Deliver an inbound event. Returns `false` once the session stopped reading.
    pub async fn push(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Non-async variant of [`push`](Self::push); fails when the channel is full.
    pub fn try_push(&self, event: TransportEvent) -> bool {
        self.events.try_send(event).is_ok()
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<EncodedChunk> {
        self.sent.try_iter().collect()
    }

    /// Wait up to `timeout` for the next outbound chunk.
    pub fn recv_sent_timeout(&self, timeout: Duration) -> Option<EncodedChunk> {
        self.sent.recv_timeout(timeout).ok()
    }

    /// Whether the session closed its side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Break the link so the next `send` fails.
    pub fn drop_link(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Config the session connected with.
    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_plan_is_consumed_once() {
        let connector = MemoryConnector::new();
        connector.fail_next_connect("nope");

        let err = connector.connect(&ConnectConfig::default()).await.unwrap_err();
        assert!(matches!(err, VoxError::ConnectFailed(ref r) if r == "nope"));
        assert!(connector.take_remote().is_none());

        assert!(connector.connect(&ConnectConfig::default()).await.is_ok());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn chunks_and_events_cross_the_link() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect(&ConnectConfig::default()).await.unwrap();
        let remote = connector.take_remote().unwrap();

        conn.transport.send(EncodedChunk::new("AAA=", 16_000)).unwrap();
        assert_eq!(remote.sent(), vec![EncodedChunk::new("AAA=", 16_000)]);

        assert!(remote.push(TransportEvent::Interrupted).await);
        assert_eq!(conn.events.recv().await, Some(TransportEvent::Interrupted));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let connector = MemoryConnector::new();
        let conn = connector.connect(&ConnectConfig::default()).await.unwrap();
        let remote = connector.take_remote().unwrap();

        conn.transport.close().unwrap();
        conn.transport.close().unwrap();
        assert!(remote.is_closed());
        assert!(matches!(
            conn.transport.send(EncodedChunk::new("", 16_000)),
            Err(VoxError::SendFailed(_))
        ));
    }
}
