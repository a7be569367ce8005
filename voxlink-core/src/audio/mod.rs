//! Capture pipeline: microphone → fixed-size 16 kHz mono frames → sink.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a mutex, or perform I/O. It only
//! down-mixes into a scratch buffer sized on first use and pushes into an
//! SPSC ring buffer producer.
//!
//! A dedicated capture worker thread drains the ring, resamples to the wire
//! rate when the hardware cannot run at 16 kHz, cuts fixed-size frames and
//! invokes the registered [`FrameSink`] synchronously. The sink has one frame
//! period (`frame_size / sample_rate`, 256 ms at the defaults) per call.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. The worker thread therefore
//! opens the stream itself and drops it on exit; [`CaptureHandle::stop`]
//! only flips the running flag and joins the worker.

pub mod device;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{buffering::chunk::AudioFrame, error::Result};

/// Wire rate for outbound audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Samples per outbound frame (256 ms at 16 kHz).
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Capture device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    /// Rate of the delivered frames (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Channel count of the delivered frames. Default: 1.
    pub channels: u16,
    /// Samples per delivered frame. Default: 4096.
    pub frame_size: usize,
    /// Input device name; `None` selects the system default.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
            frame_size: DEFAULT_FRAME_SIZE,
            preferred_device: None,
        }
    }
}

impl CaptureConfig {
    /// Frame period in milliseconds; the sink's time budget per call.
    pub fn frame_period_ms(&self) -> u64 {
        (self.frame_size as u64 * 1000) / self.sample_rate.max(1) as u64
    }
}

/// Receives every captured frame on the capture worker thread.
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Something that can open a microphone and feed a [`FrameSink`].
///
/// Implementations spawn their own worker and return a [`CaptureHandle`]
/// that owns it.
pub trait InputBackend: Send + Sync + 'static {
    /// # Errors
    /// `VoxError::DeviceUnavailable` when the device cannot be opened
    /// (permission denied, no hardware, unsupported format).
    fn open(&self, config: &CaptureConfig, sink: FrameSink) -> Result<CaptureHandle>;
}

/// Owns a running capture worker.
///
/// Dropping the handle stops capture.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureHandle {
    /// Wrap a worker that delivers frames while `running` is `true` and
    /// returns once it observes `false`.
    pub fn new(running: Arc<AtomicBool>, worker: JoinHandle<()>) -> Self {
        Self {
            running,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Release the device. Idempotent, callable from any thread.
    ///
    /// Joins the worker, so no frame is delivered after this returns. Calling
    /// it from inside the sink only flips the flag.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == std::thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("capture worker panicked");
        }
        debug!("capture stopped");
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_input {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    };
    use std::time::Duration;

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
        SupportedStreamConfig,
    };
    use tracing::{error, info, warn};

    use super::{device::select_input_device, resample::RateConverter};
    use super::{CaptureConfig, CaptureHandle, FrameSink, InputBackend};
    use crate::{
        buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, FrameAssembler, Producer},
        error::{Result, VoxError},
    };

    /// Samples drained from the ring per worker iteration.
    const DRAIN_CHUNK: usize = 960;

    /// Worker sleep when the ring is empty (avoids burning a core).
    const SLEEP_EMPTY_MS: u64 = 5;

    /// Microphone capture through the default cpal host.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalInput;

    impl CpalInput {
        pub fn new() -> Self {
            Self
        }
    }

    impl InputBackend for CpalInput {
        fn open(&self, config: &CaptureConfig, sink: FrameSink) -> Result<CaptureHandle> {
            let running = Arc::new(AtomicBool::new(true));
            let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();
            let worker_config = config.clone();
            let worker_running = Arc::clone(&running);

            let worker = std::thread::Builder::new()
                .name("voxlink-capture".into())
                .spawn(move || {
                    let (producer, consumer) = create_audio_ring();
                    // Stream must be created and dropped on this thread.
                    let (stream, device_rate) = match open_stream(&worker_config, producer, &worker_running) {
                        Ok(opened) => opened,
                        Err(e) => {
                            worker_running.store(false, Ordering::Release);
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = open_tx.send(Ok(device_rate));
                    run_worker(&worker_config, consumer, device_rate, sink, &worker_running);
                    drop(stream);
                })
                .map_err(VoxError::Io)?;

            match open_rx.recv() {
                Ok(Ok(device_rate)) => {
                    info!(device_rate, wire_rate = config.sample_rate, "capture started");
                    Ok(CaptureHandle::new(running, worker))
                }
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => {
                    let _ = worker.join();
                    Err(VoxError::DeviceUnavailable(
                        "capture worker died before opening the device".into(),
                    ))
                }
            }
        }
    }

    /// Prefer a hardware config at the wire rate; fall back to the device default.
    fn choose_config(device: &cpal::Device, wanted_rate: u32) -> Result<SupportedStreamConfig> {
        if let Ok(ranges) = device.supported_input_configs() {
            let mut candidates: Vec<_> = ranges
                .filter(|r| {
                    r.min_sample_rate().0 <= wanted_rate && r.max_sample_rate().0 >= wanted_rate
                })
                .collect();
            candidates.sort_by_key(|r| (r.channels() != 1, r.sample_format() != SampleFormat::F32));
            if let Some(range) = candidates.into_iter().next() {
                return Ok(range.with_sample_rate(SampleRate(wanted_rate)));
            }
        }
        device
            .default_input_config()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))
    }

    fn open_stream(
        config: &CaptureConfig,
        producer: AudioProducer,
        running: &Arc<AtomicBool>,
    ) -> Result<(Stream, u32)> {
        let device = select_input_device(config.preferred_device.as_deref())?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = choose_config(&device, config.sample_rate)?;
        let device_rate = supported.sample_rate().0;
        let stream_config: StreamConfig = supported.config();
        info!(
            device_rate,
            channels = stream_config.channels,
            format = ?supported.sample_format(),
            "input config selected"
        );

        let running = Arc::clone(running);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32>(&device, &stream_config, producer, running),
            SampleFormat::I16 => build::<i16>(&device, &stream_config, producer, running),
            SampleFormat::U16 => build::<u16>(&device, &stream_config, producer, running),
            SampleFormat::U8 => build::<u8>(&device, &stream_config, producer, running),
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
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let ch = config.channels.max(1) as usize;
        let mut mix_buf: Vec<f32> = Vec::new();
        device
            .build_input_stream(
                config,
                move |data: &[T], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = data.len() / ch;
                    mix_buf.resize(frames, 0.0);
                    for (f, out) in mix_buf.iter_mut().enumerate() {
                        let base = f * ch;
                        let mut sum = 0f32;
                        for c in 0..ch {
                            sum += data[base + c].to_sample::<f32>();
                        }
                        *out = sum / ch as f32;
                    }
                    let written = producer.push_slice(&mix_buf);
                    if written < mix_buf.len() {
                        warn!("capture ring full: dropped {} samples", mix_buf.len() - written);
                    }
                },
                |err| error!("input stream error: {err}"),
                None,
            )
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))
    }

    fn run_worker(
        config: &CaptureConfig,
        mut consumer: AudioConsumer,
        device_rate: u32,
        mut sink: FrameSink,
        running: &AtomicBool,
    ) {
        let mut resampler = match RateConverter::new(device_rate, config.sample_rate, DRAIN_CHUNK) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to create capture resampler: {e}");
                return;
            }
        };
        let mut assembler = FrameAssembler::new(config.frame_size, config.sample_rate);
        let mut raw = vec![0f32; DRAIN_CHUNK];

        while running.load(Ordering::Acquire) {
            let n = consumer.pop_slice(&mut raw);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
                continue;
            }

            let converted = resampler.process(&raw[..n]);
            for frame in assembler.push(&converted) {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                sink(frame);
            }
        }
        info!("capture worker exiting");
    }
}

#[cfg(feature = "audio-cpal")]
pub use cpal_input::CpalInput;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config_matches_wire_format() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.sample_rate, 16_000);
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.frame_size, 4096);
        assert_eq!(cfg.frame_period_ms(), 256);
    }

    #[test]
    fn stop_joins_worker_and_is_idempotent() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let worker = std::thread::spawn(move || {
            while flag.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let handle = CaptureHandle::new(running, worker);
        assert!(handle.is_running());
        handle.stop();
        assert!(!handle.is_running());
        handle.stop();
    }
}
