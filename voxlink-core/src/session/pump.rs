//! The two routing loops of an active session.
//!
//! ```text
//! capture sink ─► OutboundQueue ─► send pump (thread) ─► Transport::send
//!                                        │ SendFailed
//!                                        ▼
//! Transport events ──────────────► inbound reader (task) ─► PlaybackScheduler
//!                                        │ Closed / Error / SendFailed
//!                                        ▼
//!                                 teardown (blocking pool)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{diagnostics::SessionDiagnostics, Shared};
use crate::{
    buffering::OutboundQueue,
    codec::EncodedChunk,
    error::VoxError,
    ipc::events::SessionStatus,
    playback::PlaybackScheduler,
    transport::{Delivery, Transport, TransportEvent},
};

/// How long the pump waits for a frame before re-checking the gate.
const PUMP_POLL: Duration = Duration::from_millis(20);

/// Out-of-band signals into the inbound reader.
#[derive(Debug)]
pub(crate) enum Control {
    SendFailed(String),
}

/// Drain the outbound queue into the transport until the queue closes or
/// a send fails.
pub(crate) fn run_send_pump(
    queue: OutboundQueue<EncodedChunk>,
    transport: Arc<dyn Transport>,
    diagnostics: Arc<SessionDiagnostics>,
    control: mpsc::UnboundedSender<Control>,
) {
    debug!("send pump started");
    while queue.is_open() {
        let Some(chunk) = queue.pop_timeout(PUMP_POLL) else {
            continue;
        };
        match transport.send(chunk) {
            Ok(Delivery::Queued) => SessionDiagnostics::bump(&diagnostics.frames_sent),
            Ok(Delivery::Displaced) => {
                // The new frame takes the displaced one's place in `frames_sent`.
                SessionDiagnostics::bump(&diagnostics.frames_dropped);
                debug!("transport backed up, oldest pending frame dropped");
            }
            Err(e) => {
                warn!("outbound send failed: {e}");
                let _ = control.send(Control::SendFailed(e.to_string()));
                break;
            }
        }
    }
    debug!("send pump finished");
}

/// Everything the inbound reader needs.
pub(crate) struct Reader {
    pub shared: Weak<Shared>,
    pub epoch: u64,
    pub events: mpsc::Receiver<TransportEvent>,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub playback: Arc<PlaybackScheduler>,
    pub diagnostics: Arc<SessionDiagnostics>,
}

/// Apply inbound events in arrival order until the session ends.
pub(crate) async fn run_reader(mut reader: Reader) {
    let reason = loop {
        let event = tokio::select! {
            Some(Control::SendFailed(reason)) = reader.control.recv() => {
                break Some(format!("send failed: {reason}"));
            }
            event = reader.events.recv() => event,
        };

        match event {
            Some(TransportEvent::AudioChunk(chunk)) => {
                SessionDiagnostics::bump(&reader.diagnostics.chunks_received);
                match reader.playback.enqueue(&chunk) {
                    Ok(Some(_)) => SessionDiagnostics::bump(&reader.diagnostics.segments_scheduled),
                    Ok(None) => {}
                    Err(VoxError::MalformedChunk(detail)) => {
                        SessionDiagnostics::bump(&reader.diagnostics.chunks_malformed);
                        warn!("dropping malformed chunk: {detail}");
                    }
                    Err(e) => warn!("playback rejected chunk: {e}"),
                }
            }
            Some(TransportEvent::Interrupted) => {
                SessionDiagnostics::bump(&reader.diagnostics.interrupts);
                debug!("remote interrupted playback");
                reader.playback.clear();
            }
            Some(TransportEvent::Closed { reason }) => {
                info!(reason = reason.as_deref().unwrap_or(""), "remote closed session");
                break reason.map(|r| format!("remote closed: {r}"));
            }
            Some(TransportEvent::Error(detail)) => {
                warn!("transport error: {detail}");
                break Some(VoxError::Remote(detail).to_string());
            }
            None => {
                info!("inbound stream ended");
                break None;
            }
        }
    };

    let Some(shared) = reader.shared.upgrade() else {
        return;
    };
    let epoch = reader.epoch;
    // Teardown joins threads; keep it off the runtime workers.
    tokio::task::spawn_blocking(move || {
        shared.teardown(Some(epoch), SessionStatus::Idle, reason);
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::error::Result;

    /// Accepts the first chunk, then reports every later one as displacing
    /// an older pending chunk.
    #[derive(Default)]
    struct BackedUp {
        calls: AtomicUsize,
    }

    impl Transport for BackedUp {
        fn send(&self, _chunk: EncodedChunk) -> Result<Delivery> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Delivery::Queued)
            } else {
                Ok(Delivery::Displaced)
            }
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn displaced_frames_count_as_dropped() {
        let queue = OutboundQueue::new(4);
        queue.open();
        for _ in 0..3 {
            queue.push(EncodedChunk::new("AAA=", 16_000));
        }

        let transport = Arc::new(BackedUp::default());
        let diagnostics = Arc::new(SessionDiagnostics::default());
        let (control_tx, _control_rx) = mpsc::unbounded_channel();

        let pump = {
            let queue = queue.clone();
            let transport: Arc<dyn Transport> = transport.clone();
            let diagnostics = Arc::clone(&diagnostics);
            std::thread::spawn(move || run_send_pump(queue, transport, diagnostics, control_tx))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.calls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        queue.close();
        pump.join().unwrap();

        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.frames_dropped, 2);
    }
}
