//! `VoiceSession`: the lifecycle controller.
//!
//! ## State machine
//!
//! ```text
//!            start()                  connected
//!   Idle ───────────► Connecting ─────────────────► Active
//!    ▲                    │ DeviceUnavailable /        │ stop() / Closed /
//!    │                    │ ConnectFailed              │ Error / SendFailed
//!    │                    ▼                            ▼
//!    │   stop()        Failed                       Closing ──► Idle
//!    └────────────────────┘
//! ```
//!
//! ## Ordering on start
//!
//! 1. Tear down whatever was running (stop-then-start).
//! 2. Open capture. Failure here never touches the output device or the network.
//! 3. Open playback.
//! 4. `Connector::connect`.
//! 5. Wire capture → send pump and transport → reader; status = Active.
//!
//! ## Teardown
//!
//! Stop capture, shut playback down, close the transport, in that order.
//! Every step runs even when an earlier one fails; failures are logged.
//!
//! ## Concurrency
//!
//! Each start takes a fresh epoch. Any teardown bumps it, so a start still
//! awaiting `connect` sees the change when it resumes, releases what it
//! opened and returns `VoxError::Cancelled`.

pub mod diagnostics;
mod pump;

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::{
    audio::{CaptureConfig, CaptureHandle, FrameSink, InputBackend},
    buffering::{OutboundQueue, PushOutcome},
    codec::{self, EncodedChunk},
    error::{Result, VoxError},
    ipc::events::{SessionStatus, SessionStatusEvent},
    playback::{OutputBackend, PlaybackConfig, PlaybackScheduler},
    transport::{ConnectConfig, Connector, Transport},
};

pub use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};

/// Status broadcast capacity.
const BROADCAST_CAP: usize = 64;

/// Configuration for [`VoiceSession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub connect: ConnectConfig,
    /// Frames the outbound queue holds before evicting the oldest. Default: 4.
    pub outbound_queue_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            connect: ConnectConfig::default(),
            outbound_queue_frames: 4,
        }
    }
}

/// Caller-owned voice session. Cheap to clone; clones share the session.
///
/// Dropping the last clone releases every device and the connection.
#[derive(Clone)]
pub struct VoiceSession {
    shared: Arc<Shared>,
}

/// What a live session holds. Every field is optional so a partially
/// started session can be released the same way as a running one.
#[derive(Default)]
struct Resources {
    capture: Option<CaptureHandle>,
    outbound: Option<OutboundQueue<EncodedChunk>>,
    pump: Option<JoinHandle<()>>,
    playback: Option<Arc<PlaybackScheduler>>,
    transport: Option<Arc<dyn Transport>>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl Resources {
    fn is_empty(&self) -> bool {
        self.capture.is_none()
            && self.outbound.is_none()
            && self.pump.is_none()
            && self.playback.is_none()
            && self.transport.is_none()
            && self.reader.is_none()
    }

    fn release(mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(queue) = self.outbound.take() {
            queue.close();
        }
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!("send pump panicked");
            }
        }
        if let Some(playback) = self.playback.take() {
            playback.shutdown();
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                warn!("transport close failed: {e}");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

struct State {
    status: SessionStatus,
    epoch: u64,
    resources: Resources,
}

pub(crate) struct Shared {
    config: SessionConfig,
    input: Arc<dyn InputBackend>,
    output: Arc<dyn OutputBackend>,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    /// Serialises teardowns so a second `stop` waits for the first.
    teardown_lock: Mutex<()>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl Shared {
    fn set_status(&self, state: &mut State, status: SessionStatus, detail: Option<String>) {
        state.status = status;
        let _ = self.status_tx.send(SessionStatusEvent { status, detail });
    }

    /// Release everything and settle on `final_status`.
    ///
    /// With `expected_epoch`, only acts if no other start or teardown has
    /// happened since. Returns whether it did anything.
    pub(crate) fn teardown(
        &self,
        expected_epoch: Option<u64>,
        final_status: SessionStatus,
        detail: Option<String>,
    ) -> bool {
        let _guard = self.teardown_lock.lock();
        self.teardown_locked(expected_epoch, final_status, detail)
    }

    fn teardown_locked(
        &self,
        expected_epoch: Option<u64>,
        final_status: SessionStatus,
        detail: Option<String>,
    ) -> bool {
        let resources = {
            let mut state = self.state.lock();
            if expected_epoch.is_some_and(|e| e != state.epoch) {
                return false;
            }
            if state.status == final_status && state.resources.is_empty() {
                return false;
            }
            state.epoch += 1;
            if state.status == SessionStatus::Active {
                self.set_status(&mut state, SessionStatus::Closing, None);
            }
            std::mem::take(&mut state.resources)
        };

        resources.release();

        let mut state = self.state.lock();
        self.set_status(&mut state, final_status, detail);
        info!(status = %final_status, "session torn down");
        true
    }

    /// Tear down whatever is running, then enter `Connecting` with a new epoch.
    fn begin(&self) -> u64 {
        let _guard = self.teardown_lock.lock();
        self.teardown_locked(None, SessionStatus::Idle, None);

        let mut state = self.state.lock();
        state.epoch += 1;
        self.set_status(&mut state, SessionStatus::Connecting, None);
        state.epoch
    }

    /// Store a freshly opened resource, or hand it back if the start went stale.
    fn install<T>(
        &self,
        epoch: u64,
        value: T,
        slot: fn(&mut Resources) -> &mut Option<T>,
    ) -> std::result::Result<(), T> {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return Err(value);
        }
        *slot(&mut state.resources) = Some(value);
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let resources = std::mem::take(&mut self.state.get_mut().resources);
        if !resources.is_empty() {
            resources.release();
        }
    }
}

impl VoiceSession {
    /// Create an idle session. Nothing is opened until [`start`](Self::start).
    pub fn new(
        config: SessionConfig,
        input: Arc<dyn InputBackend>,
        output: Arc<dyn OutputBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            shared: Arc::new(Shared {
                config,
                input,
                output,
                connector,
                state: Mutex::new(State {
                    status: SessionStatus::Idle,
                    epoch: 0,
                    resources: Resources::default(),
                }),
                teardown_lock: Mutex::new(()),
                status_tx,
                diagnostics: Arc::new(SessionDiagnostics::default()),
            }),
        }
    }

    /// Open devices, connect, and start streaming.
    ///
    /// A running session is torn down first. Returns once the session is
    /// `Active`.
    ///
    /// # Errors
    /// - `VoxError::DeviceUnavailable`: capture or playback could not open;
    ///   status = `Failed`.
    /// - `VoxError::ConnectFailed`: status = `Failed`, devices released.
    /// - `VoxError::Cancelled`: a `stop` (or another `start`) overtook this one.
    pub async fn start(&self) -> Result<()> {
        let epoch = self.shared.begin();
        self.shared.diagnostics.reset();
        info!(epoch, "session starting");

        match self.open_and_connect(epoch).await {
            Ok(()) => {
                info!(epoch, "session active");
                Ok(())
            }
            Err(VoxError::Cancelled) => {
                info!(epoch, "session start cancelled");
                Err(VoxError::Cancelled)
            }
            Err(e) => {
                warn!(epoch, "session start failed: {e}");
                self.shared
                    .teardown(Some(epoch), SessionStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open_and_connect(&self, epoch: u64) -> Result<()> {
        let shared = &self.shared;
        let outbound = OutboundQueue::<EncodedChunk>::new(shared.config.outbound_queue_frames);

        // ── Capture ──────────────────────────────────────────────────────────
        let sink = capture_sink(outbound.clone(), Arc::clone(&shared.diagnostics));
        let input = Arc::clone(&shared.input);
        let capture_config = shared.config.capture.clone();
        let capture = tokio::task::spawn_blocking(move || input.open(&capture_config, sink))
            .await
            .map_err(|e| VoxError::DeviceUnavailable(format!("capture open task: {e}")))?
            .map_err(into_device_error)?;
        shared
            .install(epoch, capture, |r| &mut r.capture)
            .map_err(|capture| {
                capture.stop();
                VoxError::Cancelled
            })?;

        // ── Playback ─────────────────────────────────────────────────────────
        let output = Arc::clone(&shared.output);
        let playback_config = shared.config.playback.clone();
        let playback = tokio::task::spawn_blocking(move || {
            PlaybackScheduler::open(output.as_ref(), &playback_config)
        })
        .await
        .map_err(|e| VoxError::DeviceUnavailable(format!("playback open task: {e}")))?
        .map_err(into_device_error)?;
        let playback = Arc::new(playback);
        shared
            .install(epoch, Arc::clone(&playback), |r| &mut r.playback)
            .map_err(|playback| {
                playback.shutdown();
                VoxError::Cancelled
            })?;

        // ── Connect ──────────────────────────────────────────────────────────
        let connection = shared
            .connector
            .connect(&shared.config.connect)
            .await
            .map_err(|e| match e {
                VoxError::ConnectFailed(_) => e,
                other => VoxError::ConnectFailed(other.to_string()),
            })?;

        // ── Activate ─────────────────────────────────────────────────────────
        let mut state = shared.state.lock();
        if state.epoch != epoch {
            drop(state);
            if let Err(e) = connection.transport.close() {
                warn!("closing stale transport failed: {e}");
            }
            return Err(VoxError::Cancelled);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        outbound.open();

        let pump = {
            let queue = outbound.clone();
            let transport = Arc::clone(&connection.transport);
            let diagnostics = Arc::clone(&shared.diagnostics);
            std::thread::Builder::new()
                .name("voxlink-send".into())
                .spawn(move || pump::run_send_pump(queue, transport, diagnostics, control_tx))
        };
        let pump = match pump {
            Ok(pump) => pump,
            Err(e) => {
                outbound.close();
                drop(state);
                if let Err(close_err) = connection.transport.close() {
                    warn!("transport close failed: {close_err}");
                }
                return Err(VoxError::Io(e));
            }
        };

        let reader = tokio::spawn(pump::run_reader(pump::Reader {
            shared: Arc::downgrade(shared),
            epoch,
            events: connection.events,
            control: control_rx,
            playback,
            diagnostics: Arc::clone(&shared.diagnostics),
        }));

        state.resources.outbound = Some(outbound);
        state.resources.pump = Some(pump);
        state.resources.transport = Some(connection.transport);
        state.resources.reader = Some(reader);
        shared.set_status(&mut state, SessionStatus::Active, None);
        Ok(())
    }

    /// Drive the session to `Idle`. Accepted in every state; idempotent.
    ///
    /// Blocks while devices are released (a few milliseconds). Safe to call
    /// concurrently with capture callbacks and inbound events.
    pub fn stop(&self) {
        if self.shared.teardown(None, SessionStatus::Idle, None) {
            info!("session stopped");
        }
    }

    /// Current status (snapshot).
    pub fn status(&self) -> SessionStatus {
        self.shared.state.lock().status
    }

    /// Subscribe to status transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Snapshot of the session counters.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Encode on the capture thread and hand off without waiting.
fn capture_sink(
    queue: OutboundQueue<EncodedChunk>,
    diagnostics: Arc<SessionDiagnostics>,
) -> FrameSink {
    Box::new(move |frame| {
        SessionDiagnostics::bump(&diagnostics.frames_captured);
        match queue.push(codec::encode(&frame)) {
            PushOutcome::Queued => {}
            PushOutcome::Evicted | PushOutcome::Gated => {
                SessionDiagnostics::bump(&diagnostics.frames_dropped)
            }
        }
    })
}

fn into_device_error(e: VoxError) -> VoxError {
    match e {
        VoxError::DeviceUnavailable(_) => e,
        other => VoxError::DeviceUnavailable(other.to_string()),
    }
}
