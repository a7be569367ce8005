//! Output device boundary and the cpal-backed implementation.
//!
//! The scheduler talks to an [`OutputDevice`] in logical frames at the
//! playback rate (24 kHz). The device owns its own monotonic clock and
//! renders every submitted segment starting exactly at its `start` frame.

use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use super::queue::SegmentId;
use crate::error::Result;

/// Wire rate for inbound audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Output device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaybackConfig {
    /// Logical clock and segment rate (Hz). Default: 24000.
    pub sample_rate: u32,
    /// Channel count of inbound chunks. Default: 1.
    pub channels: u16,
    /// Output device name; `None` selects the system default.
    pub preferred_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            channels: 1,
            preferred_device: None,
        }
    }
}

/// One mono segment handed to the device.
#[derive(Debug, Clone)]
pub struct SegmentSubmission {
    pub id: SegmentId,
    /// Start frame on the device clock.
    pub start: u64,
    pub samples: Arc<[f32]>,
}

/// An open output device.
pub trait OutputDevice: Send + Sync {
    /// Current device clock in frames at the configured playback rate.
    ///
    /// A segment submitted with `start >= now()` must play in full.
    fn now(&self) -> u64;

    /// Queue a segment for playback at `segment.start`. Must not block.
    fn submit(&self, segment: SegmentSubmission) -> Result<()>;

    /// Silence and discard every playing or pending segment immediately.
    fn cancel_all(&self);

    /// Release the hardware. Idempotent.
    fn close(&self);
}

/// Opens output devices. Finished segment ids are reported on `completions`.
pub trait OutputBackend: Send + Sync + 'static {
    /// # Errors
    /// `VoxError::DeviceUnavailable` when the device cannot be opened.
    fn open(
        &self,
        config: &PlaybackConfig,
        completions: Sender<SegmentId>,
    ) -> Result<Box<dyn OutputDevice>>;
}

#[cfg(feature = "audio-cpal")]
mod cpal_output {
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc,
    };
    use std::thread::JoinHandle;

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
        SupportedStreamConfig,
    };
    use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
    use parking_lot::Mutex;
    use tracing::{error, info, warn};

    use super::{OutputBackend, OutputDevice, PlaybackConfig, SegmentSubmission};
    use crate::{
        audio::device::select_output_device,
        error::{Result, VoxError},
        playback::{
            queue::SegmentId,
            render::{Renderer, Retired, Voice, MIX_BLOCK, VOICE_CAPACITY},
        },
    };

    /// Pending submissions between the scheduler and the render callback.
    const COMMAND_CAPACITY: usize = 256;

    /// Speaker output through the default cpal host.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalOutput;

    impl CpalOutput {
        pub fn new() -> Self {
            Self
        }
    }

    /// Shared between the render callback and the scheduler. All values are
    /// logical frames except `generation`.
    struct Clock {
        /// Frames mixed so far.
        mixed: AtomicU64,
        /// Frames mixed by the last callback plus one mix block: the lead a
        /// new segment needs to be picked up before its start is mixed.
        lead: AtomicU64,
        /// Bumped by `cancel_all`.
        generation: AtomicU64,
    }

    pub struct CpalOutputDevice {
        commands: Sender<Voice>,
        clock: Arc<Clock>,
        shutdown: Mutex<Option<Sender<()>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
        closed: AtomicBool,
    }

    impl OutputDevice for CpalOutputDevice {
        fn now(&self) -> u64 {
            let mixed = self.clock.mixed.load(Ordering::Acquire);
            let lead = self.clock.lead.load(Ordering::Acquire);
            mixed + lead
        }

        fn submit(&self, segment: SegmentSubmission) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(VoxError::AudioStream("output device closed".into()));
            }
            let voice = Voice {
                id: segment.id,
                start: segment.start,
                samples: segment.samples,
                generation: self.clock.generation.load(Ordering::Acquire),
            };
            match self.commands.try_send(voice) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    Err(VoxError::AudioStream("output command queue full".into()))
                }
                Err(TrySendError::Disconnected(_)) => {
                    Err(VoxError::AudioStream("output stream gone".into()))
                }
            }
        }

        fn cancel_all(&self) {
            self.clock.generation.fetch_add(1, Ordering::AcqRel);
        }

        fn close(&self) {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(tx) = self.shutdown.lock().take() {
                let _ = tx.send(());
            }
            if let Some(worker) = self.worker.lock().take() {
                if worker.join().is_err() {
                    warn!("output worker panicked");
                }
            }
            info!("output device released");
        }
    }

    impl Drop for CpalOutputDevice {
        fn drop(&mut self) {
            self.close();
        }
    }

    impl OutputBackend for CpalOutput {
        fn open(
            &self,
            config: &PlaybackConfig,
            completions: Sender<SegmentId>,
        ) -> Result<Box<dyn OutputDevice>> {
            let (cmd_tx, cmd_rx) = bounded::<Voice>(COMMAND_CAPACITY);
            let (retire_tx, retire_rx) = bounded::<Retired>(COMMAND_CAPACITY + VOICE_CAPACITY);
            let clock = Arc::new(Clock {
                mixed: AtomicU64::new(0),
                lead: AtomicU64::new(MIX_BLOCK as u64),
                generation: AtomicU64::new(0),
            });
            let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();
            let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
            let preferred = config.preferred_device.clone();
            let logical_rate = config.sample_rate.max(1);
            let worker_clock = Arc::clone(&clock);

            // Stream is !Send: it lives and dies on this thread, which also
            // frees retired buffers and reports completions.
            let worker = std::thread::Builder::new()
                .name("voxlink-playback".into())
                .spawn(move || {
                    let stream = match open_stream(
                        preferred.as_deref(),
                        logical_rate,
                        cmd_rx,
                        retire_tx,
                        worker_clock,
                    ) {
                        Ok((stream, rate)) => {
                            let _ = open_tx.send(Ok(rate));
                            stream
                        }
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                    loop {
                        select! {
                            recv(retire_rx) -> retired => match retired {
                                Ok(retired) => {
                                    if retired.completed {
                                        let _ = completions.send(retired.id);
                                    }
                                    drop(retired.samples);
                                }
                                Err(_) => break,
                            },
                            recv(shutdown_rx) -> _ => break,
                        }
                    }
                    drop(stream);
                })
                .map_err(VoxError::Io)?;

            let device_rate = match open_rx.recv() {
                Ok(Ok(rate)) => rate,
                Ok(Err(e)) => {
                    let _ = worker.join();
                    return Err(e);
                }
                Err(_) => {
                    let _ = worker.join();
                    return Err(VoxError::DeviceUnavailable(
                        "playback worker died before opening the device".into(),
                    ));
                }
            };
            info!(device_rate, logical_rate, "playback started");

            Ok(Box::new(CpalOutputDevice {
                commands: cmd_tx,
                clock,
                shutdown: Mutex::new(Some(shutdown_tx)),
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
            }))
        }
    }

    /// Prefer a config at the logical rate so no conversion is needed.
    fn choose_config(device: &cpal::Device, wanted_rate: u32) -> Result<SupportedStreamConfig> {
        if let Ok(ranges) = device.supported_output_configs() {
            let mut candidates: Vec<_> = ranges
                .filter(|r| {
                    r.min_sample_rate().0 <= wanted_rate
                        && r.max_sample_rate().0 >= wanted_rate
                        && matches!(
                            r.sample_format(),
                            SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                        )
                })
                .collect();
            candidates.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));
            if let Some(range) = candidates.into_iter().next() {
                return Ok(range.with_sample_rate(SampleRate(wanted_rate)));
            }
        }
        device
            .default_output_config()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))
    }

    fn open_stream(
        preferred: Option<&str>,
        logical_rate: u32,
        commands: Receiver<Voice>,
        retire: Sender<Retired>,
        clock: Arc<Clock>,
    ) -> Result<(Stream, u32)> {
        let device = select_output_device(preferred)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = choose_config(&device, logical_rate)?;
        let device_rate = supported.sample_rate().0;
        let config: StreamConfig = supported.config();
        info!(
            device_rate,
            channels = config.channels,
            format = ?supported.sample_format(),
            "output config selected"
        );

        let renderer = Renderer::new(logical_rate, device_rate, retire)?;
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32>(&device, &config, renderer, commands, clock),
            SampleFormat::I16 => build::<i16>(&device, &config, renderer, commands, clock),
            SampleFormat::U16 => build::<u16>(&device, &config, renderer, commands, clock),
            fmt => {
                return Err(VoxError::DeviceUnavailable(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;
        Ok((stream, device_rate))
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut renderer: Renderer,
        commands: Receiver<Voice>,
        clock: Arc<Clock>,
    ) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let ch = config.channels.max(1) as usize;

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _info| {
                    renderer.pull(&commands, clock.generation.load(Ordering::Acquire));

                    let before = renderer.mixed();
                    for frame in data.chunks_mut(ch) {
                        let out = T::from_sample(renderer.next_sample());
                        for s in frame.iter_mut() {
                            *s = out;
                        }
                    }
                    let mixed = renderer.mixed();

                    clock
                        .lead
                        .store(mixed - before + MIX_BLOCK as u64, Ordering::Release);
                    clock.mixed.store(mixed, Ordering::Release);
                },
                |err| error!("output stream error: {err}"),
                None,
            )
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))
    }
}

#[cfg(feature = "audio-cpal")]
pub use cpal_output::{CpalOutput, CpalOutputDevice};
