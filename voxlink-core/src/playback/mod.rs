//! Playback scheduler: inbound chunks → gapless segments on the output device.
//!
//! ## Per chunk
//!
//! ```text
//! 1. Reap completion notifications (bookkeeping only)
//! 2. Decode base64 PCM16 → f32, down-mix to mono, convert rate if the
//!    chunk declares something other than the playback rate
//! 3. start = max(next_start, device.now()); next_start = start + frames
//! 4. Submit to the device at `start`
//! ```
//!
//! ## Interruption policy
//!
//! `clear()` silences the segment that is currently audible as well as
//! everything queued behind it. Nothing that was scheduled before the call
//! produces sound afterwards.

pub mod output;
pub mod queue;
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
pub(crate) mod render;

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::resample::convert_block,
    codec::{self, EncodedChunk},
    error::{Result, VoxError},
};

pub use output::{OutputBackend, OutputDevice, PlaybackConfig, SegmentSubmission};
pub use queue::{PlaybackQueue, ScheduledSegment, SegmentId};

#[cfg(feature = "audio-cpal")]
pub use output::{CpalOutput, CpalOutputDevice};

/// Owns the output device and the segment queue.
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    device: Box<dyn OutputDevice>,
    queue: Mutex<PlaybackQueue>,
    completions: Receiver<SegmentId>,
    closed: AtomicBool,
}

impl PlaybackScheduler {
    /// Open the output device through `backend`.
    ///
    /// # Errors
    /// Whatever the backend reports, normally `VoxError::DeviceUnavailable`.
    pub fn open(backend: &dyn OutputBackend, config: &PlaybackConfig) -> Result<Self> {
        let (completion_tx, completion_rx) = unbounded();
        let device = backend.open(config, completion_tx)?;
        Ok(Self::with_device(config.clone(), device, completion_rx))
    }

    /// Build around an already-open device.
    pub fn with_device(
        config: PlaybackConfig,
        device: Box<dyn OutputDevice>,
        completions: Receiver<SegmentId>,
    ) -> Self {
        Self {
            config,
            device,
            queue: Mutex::new(PlaybackQueue::new()),
            completions,
            closed: AtomicBool::new(false),
        }
    }

    /// Decode `chunk` and schedule it right after the previous segment.
    ///
    /// Returns `Ok(None)` for an empty chunk or after shutdown.
    ///
    /// # Errors
    /// `VoxError::MalformedChunk` when the payload cannot be decoded; the
    /// queue is left untouched. Device submission errors roll the segment back.
    pub fn enqueue(&self, chunk: &EncodedChunk) -> Result<Option<ScheduledSegment>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let frame = codec::decode(chunk, self.config.channels)?;
        let mut samples = downmix(&frame.samples, frame.channels);
        if frame.sample_rate != self.config.sample_rate {
            if frame.sample_rate == 0 {
                return Err(VoxError::MalformedChunk("zero sample rate".into()));
            }
            debug!(
                from = frame.sample_rate,
                to = self.config.sample_rate,
                "converting inbound chunk rate"
            );
            samples = convert_block(&samples, frame.sample_rate, self.config.sample_rate)?;
        }
        if samples.is_empty() {
            return Ok(None);
        }

        let mut queue = self.queue.lock();
        self.reap(&mut queue);

        let segment = queue.schedule(self.device.now(), samples.len() as u64);
        let submission = SegmentSubmission {
            id: segment.id,
            start: segment.start,
            samples: samples.into(),
        };
        if let Err(e) = self.device.submit(submission) {
            queue.unschedule(&segment);
            return Err(e);
        }

        debug!(
            id = segment.id,
            start = segment.start,
            frames = segment.frames,
            active = queue.active_len(),
            "segment scheduled"
        );
        Ok(Some(segment))
    }

    /// Stop and discard everything playing or queued. Never fails.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        self.device.cancel_all();
        // Ids from cancelled segments are stale now.
        while self.completions.try_recv().is_ok() {}
        let dropped = queue.clear(self.device.now());
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "playback cleared");
        }
    }

    /// `clear()` plus releasing the output device. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clear();
        self.device.close();
        info!("playback shut down");
    }

    /// Process pending completion notifications; returns how many were applied.
    pub fn reap_completed(&self) -> usize {
        let mut queue = self.queue.lock();
        self.reap(&mut queue)
    }

    fn reap(&self, queue: &mut PlaybackQueue) -> usize {
        let mut applied = 0;
        while let Ok(id) = self.completions.try_recv() {
            if queue.complete(id) {
                applied += 1;
            } else {
                warn!(id, "completion for unknown segment");
            }
        }
        applied
    }

    /// Segments submitted and not yet finished.
    pub fn active_len(&self) -> usize {
        self.queue.lock().active_len()
    }

    /// Earliest start for the next segment.
    pub fn next_start(&self) -> u64 {
        self.queue.lock().next_start()
    }

    pub fn now(&self) -> u64 {
        self.device.now()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::chunk::AudioFrame;
    use crossbeam_channel::Sender;
    use std::sync::{atomic::AtomicU64, Arc};

    #[derive(Default)]
    struct ManualClock {
        now: AtomicU64,
        submitted: Mutex<Vec<(SegmentId, u64, usize)>>,
        cancels: AtomicU64,
        closed: AtomicBool,
    }

    struct ManualDevice(Arc<ManualClock>);

    impl OutputDevice for ManualDevice {
        fn now(&self) -> u64 {
            self.0.now.load(Ordering::SeqCst)
        }

        fn submit(&self, segment: SegmentSubmission) -> Result<()> {
            self.0
                .submitted
                .lock()
                .push((segment.id, segment.start, segment.samples.len()));
            Ok(())
        }

        fn cancel_all(&self) {
            self.0.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    fn scheduler() -> (PlaybackScheduler, Arc<ManualClock>, Sender<SegmentId>) {
        let clock = Arc::new(ManualClock::default());
        let (tx, rx) = unbounded();
        let sched = PlaybackScheduler::with_device(
            PlaybackConfig::default(),
            Box::new(ManualDevice(Arc::clone(&clock))),
            rx,
        );
        (sched, clock, tx)
    }

    /// `ms` of a 440 Hz-ish tone at 24 kHz.
    fn chunk_ms(ms: usize) -> EncodedChunk {
        let samples = (0..ms * 24).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        codec::encode(&AudioFrame::mono(samples, 24_000))
    }

    fn advance_ms(clock: &ManualClock, ms: u64) {
        clock.now.fetch_add(ms * 24, Ordering::SeqCst);
    }

    #[test]
    fn three_chunks_play_back_to_back() {
        let (sched, clock, _tx) = scheduler();

        let s1 = sched.enqueue(&chunk_ms(100)).unwrap().unwrap();
        advance_ms(&clock, 10);
        let s2 = sched.enqueue(&chunk_ms(100)).unwrap().unwrap();
        let s3 = sched.enqueue(&chunk_ms(100)).unwrap().unwrap();

        assert_eq!(s1.start, 0);
        assert_eq!(s2.start, s1.end());
        assert_eq!(s3.start, s2.end());
        assert_eq!(s1.frames, 2400);

        let submitted = clock.submitted.lock().clone();
        assert_eq!(
            submitted,
            vec![(s1.id, 0, 2400), (s2.id, 2400, 2400), (s3.id, 4800, 2400)]
        );
    }

    #[test]
    fn gap_between_segments_never_exceeds_clock_lag() {
        let (sched, clock, _tx) = scheduler();
        let mut prev: Option<ScheduledSegment> = None;
        for i in 0..50u64 {
            // bursty: sometimes well ahead, sometimes late
            advance_ms(&clock, (i * 37) % 150);
            let now = clock.now.load(Ordering::SeqCst);
            let seg = sched.enqueue(&chunk_ms(100)).unwrap().unwrap();
            if let Some(p) = prev {
                assert!(p.end() <= seg.start, "overlap at {i}");
                // Any gap is exactly the time the device was idle before arrival.
                assert_eq!(seg.start, p.end().max(now));
            }
            prev = Some(seg);
        }
    }

    #[test]
    fn malformed_chunk_leaves_queue_untouched() {
        let (sched, _clock, _tx) = scheduler();
        sched.enqueue(&chunk_ms(100)).unwrap();
        let cursor = sched.next_start();

        let bad = EncodedChunk::from_pcm_bytes(&[1, 2, 3], 24_000);
        assert!(matches!(sched.enqueue(&bad), Err(VoxError::MalformedChunk(_))));
        assert_eq!(sched.next_start(), cursor);
        assert_eq!(sched.active_len(), 1);
    }

    #[test]
    fn clear_discards_future_segments_and_resets_cursor() {
        let (sched, clock, _tx) = scheduler();
        for _ in 0..3 {
            sched.enqueue(&chunk_ms(100)).unwrap();
        }
        advance_ms(&clock, 50);
        sched.clear();

        assert_eq!(sched.active_len(), 0);
        assert_eq!(sched.next_start(), 50 * 24);
        assert_eq!(clock.cancels.load(Ordering::SeqCst), 1);

        let next = sched.enqueue(&chunk_ms(100)).unwrap().unwrap();
        assert_eq!(next.start, 50 * 24);

        // empty clear is harmless
        sched.clear();
        sched.clear();
    }

    #[test]
    fn completions_only_do_bookkeeping() {
        let (sched, _clock, tx) = scheduler();
        let s1 = sched.enqueue(&chunk_ms(100)).unwrap().unwrap();
        let s2 = sched.enqueue(&chunk_ms(100)).unwrap().unwrap();
        let cursor = sched.next_start();

        tx.send(s2.id).unwrap();
        tx.send(s1.id).unwrap();
        assert_eq!(sched.reap_completed(), 2);
        assert_eq!(sched.active_len(), 0);
        assert_eq!(sched.next_start(), cursor);
    }

    #[test]
    fn shutdown_releases_device_once() {
        let (sched, clock, _tx) = scheduler();
        sched.enqueue(&chunk_ms(20)).unwrap();
        sched.shutdown();
        sched.shutdown();

        assert!(clock.closed.load(Ordering::SeqCst));
        assert!(sched.is_shut_down());
        assert_eq!(sched.active_len(), 0);
        assert!(sched.enqueue(&chunk_ms(20)).unwrap().is_none());
    }

    #[test]
    fn foreign_rate_chunk_is_converted() {
        let (sched, _clock, _tx) = scheduler();
        let chunk = codec::encode(&AudioFrame::mono(vec![0.1; 1600], 16_000));
        let seg = sched.enqueue(&chunk).unwrap().unwrap();
        // 100 ms at 16 kHz → 100 ms at 24 kHz
        assert_eq!(seg.frames, 2400);
    }

    #[test]
    fn empty_chunk_is_skipped() {
        let (sched, _clock, _tx) = scheduler();
        let chunk = EncodedChunk::from_pcm_bytes(&[], 24_000);
        assert!(sched.enqueue(&chunk).unwrap().is_none());
        assert_eq!(sched.next_start(), 0);
    }

    #[test]
    fn downmix_averages_channels() {
        let mono = downmix(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        approx::assert_abs_diff_eq!(mono[0], 0.3, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(mono[1], 0.0, epsilon = 1e-6);
    }
}
