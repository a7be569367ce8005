//! Mixer behind the speaker stream.
//!
//! Segments are summed on the logical playback timeline in fixed blocks of
//! [`MIX_BLOCK`] frames. When the hardware runs at another rate, one
//! resampler carries the mixed stream to the device rate for the lifetime of
//! the stream, so the seam between two back-to-back segments is just another
//! sample in a continuous signal.
//!
//! Once the stream runs nothing here allocates or frees: the voice list has
//! a fixed capacity and buffers leaving the mixer travel back over `retire`
//! to be dropped on a non-real-time thread.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use rubato::{FastFixedIn, Resampler};

use super::queue::SegmentId;
use crate::{audio::resample::fixed_ratio, error::Result};

/// Logical frames mixed per step (10 ms at 24 kHz).
pub(crate) const MIX_BLOCK: usize = 240;

/// Segments mixed at once. Further submissions wait in the command queue.
pub(crate) const VOICE_CAPACITY: usize = 64;

/// A segment on the logical timeline.
pub(crate) struct Voice {
    pub id: SegmentId,
    pub start: u64,
    pub samples: Arc<[f32]>,
    /// Cancel generation current when the segment was submitted.
    pub generation: u64,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// A voice leaving the mixer.
pub(crate) struct Retired {
    pub id: SegmentId,
    pub samples: Arc<[f32]>,
    /// `false` when cancelled before its last frame was mixed.
    pub completed: bool,
}

pub(crate) struct Renderer {
    voices: Vec<Voice>,
    generation: u64,
    /// Logical frames mixed so far.
    mixed: u64,
    block: Vec<f32>,
    /// `None` when the device runs at the logical rate.
    resampler: Option<FastFixedIn<f32>>,
    /// Device-rate output of the last step: `[1][capacity]`.
    out: Vec<Vec<f32>>,
    out_len: usize,
    out_pos: usize,
    retire: Sender<Retired>,
}

impl Renderer {
    /// # Errors
    /// `VoxError::AudioStream` if the rate pair is rejected by the resampler.
    pub fn new(logical_rate: u32, device_rate: u32, retire: Sender<Retired>) -> Result<Self> {
        let resampler = if logical_rate == device_rate {
            None
        } else {
            Some(fixed_ratio(logical_rate, device_rate, MIX_BLOCK)?)
        };
        let out_max = resampler
            .as_ref()
            .map_or(MIX_BLOCK, |r| r.output_frames_max());
        Ok(Self {
            voices: Vec::with_capacity(VOICE_CAPACITY),
            generation: 0,
            mixed: 0,
            block: vec![0.0; MIX_BLOCK],
            resampler,
            out: vec![vec![0.0; out_max]; 1],
            out_len: 0,
            out_pos: 0,
            retire,
        })
    }

    pub fn mixed(&self) -> u64 {
        self.mixed
    }

    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Apply the cancel generation, then take queued voices while there is
    /// room. Voices submitted before the latest cancel are retired unheard.
    pub fn pull(&mut self, commands: &Receiver<Voice>, generation: u64) {
        if generation > self.generation {
            self.generation = generation;
            let mut i = 0;
            while i < self.voices.len() {
                if self.voices[i].generation < generation {
                    let voice = self.voices.swap_remove(i);
                    self.retire(voice, false);
                } else {
                    i += 1;
                }
            }
            self.silence_pending();
        }

        while self.voices.len() < VOICE_CAPACITY {
            let Ok(voice) = commands.try_recv() else {
                break;
            };
            if voice.generation < self.generation {
                self.retire(voice, false);
            } else {
                self.voices.push(voice);
            }
        }
    }

    /// Next mono sample at the device rate.
    pub fn next_sample(&mut self) -> f32 {
        if self.out_pos >= self.out_len {
            self.step();
        }
        if self.out_pos >= self.out_len {
            return 0.0;
        }
        let sample = self.out[0][self.out_pos];
        self.out_pos += 1;
        sample
    }

    fn step(&mut self) {
        self.mix_block();
        self.out_pos = 0;
        self.out_len = match self.resampler.as_mut() {
            None => {
                self.out[0][..MIX_BLOCK].copy_from_slice(&self.block);
                MIX_BLOCK
            }
            Some(resampler) => {
                match resampler.process_into_buffer(&[&self.block[..]], &mut self.out, None) {
                    Ok((_consumed, produced)) => produced,
                    Err(_) => 0,
                }
            }
        };
    }

    fn mix_block(&mut self) {
        let base = self.mixed;
        let block_end = base + MIX_BLOCK as u64;
        self.block.fill(0.0);
        for voice in &self.voices {
            let from = voice.start.max(base);
            let to = voice.end().min(block_end);
            for t in from..to {
                self.block[(t - base) as usize] += voice.samples[(t - voice.start) as usize];
            }
        }
        for s in self.block.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        self.mixed = block_end;

        let mut i = 0;
        while i < self.voices.len() {
            if self.voices[i].end() <= block_end {
                let voice = self.voices.swap_remove(i);
                self.retire(voice, true);
            } else {
                i += 1;
            }
        }
    }

    /// Drop already-converted audio and the resampler's history.
    fn silence_pending(&mut self) {
        let end = self.out_len.min(self.out[0].len());
        self.out[0][self.out_pos.min(end)..end].fill(0.0);
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    fn retire(&self, voice: Voice, completed: bool) {
        // Full only if the retire thread stalls; the buffer is then freed here.
        let _ = self.retire.try_send(Retired {
            id: voice.id,
            samples: voice.samples,
            completed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crossbeam_channel::bounded;

    fn voice(id: SegmentId, start: u64, frames: usize, generation: u64) -> Voice {
        Voice {
            id,
            start,
            samples: vec![0.25f32; frames].into(),
            generation,
        }
    }

    fn back_to_back(device_rate: u32) -> Vec<f32> {
        let (retire_tx, _retire_rx) = bounded(VOICE_CAPACITY * 2);
        let mut renderer = Renderer::new(24_000, device_rate, retire_tx).unwrap();
        let (tx, rx) = bounded(8);
        // Three 100 ms segments, each starting where the previous ends.
        for (id, start) in [0u64, 2400, 4800].into_iter().enumerate() {
            tx.send(voice(id as SegmentId, start, 2400, 0)).unwrap();
        }
        renderer.pull(&rx, 0);

        let device_frames = 7200 * device_rate as usize / 24_000;
        (0..device_frames).map(|_| renderer.next_sample()).collect()
    }

    #[test]
    fn seams_are_continuous_when_resampling() {
        for rate in [48_000u32, 44_100] {
            let out = back_to_back(rate);
            // Skip the resampler's start-up ramp and the trailing delay.
            for (i, s) in out.iter().enumerate().take(out.len() - 64).skip(64) {
                assert!((s - 0.25).abs() < 1e-3, "rate {rate}: sample {i} = {s}");
            }
        }
    }

    #[test]
    fn seams_are_exact_at_the_logical_rate() {
        let out = back_to_back(24_000);
        assert_eq!(out.len(), 7200);
        for s in out {
            assert_abs_diff_eq!(s, 0.25);
        }
    }

    #[test]
    fn finished_voices_are_retired_as_completed() {
        let (retire_tx, retire_rx) = bounded(16);
        let mut renderer = Renderer::new(24_000, 24_000, retire_tx).unwrap();
        let (tx, rx) = bounded(8);
        tx.send(voice(7, 0, 300, 0)).unwrap();
        renderer.pull(&rx, 0);

        for _ in 0..MIX_BLOCK {
            renderer.next_sample();
        }
        assert!(retire_rx.try_recv().is_err());

        for _ in 0..MIX_BLOCK {
            renderer.next_sample();
        }
        let retired = retire_rx.try_recv().unwrap();
        assert_eq!(retired.id, 7);
        assert!(retired.completed);
        assert_eq!(renderer.active(), 0);
    }

    #[test]
    fn cancel_silences_and_retires_unheard() {
        let (retire_tx, retire_rx) = bounded(16);
        let mut renderer = Renderer::new(24_000, 48_000, retire_tx).unwrap();
        let (tx, rx) = bounded(8);
        tx.send(voice(1, 0, 24_000, 0)).unwrap();
        tx.send(voice(2, 24_000, 24_000, 0)).unwrap();
        renderer.pull(&rx, 0);
        for _ in 0..100 {
            renderer.next_sample();
        }

        renderer.pull(&rx, 1);
        assert_eq!(renderer.active(), 0);
        let retired: Vec<_> = retire_rx.try_iter().collect();
        assert_eq!(retired.len(), 2);
        assert!(retired.iter().all(|r| !r.completed));

        for _ in 0..2 * MIX_BLOCK {
            assert_abs_diff_eq!(renderer.next_sample(), 0.0);
        }
    }

    #[test]
    fn voice_submitted_after_cancel_survives_it() {
        let (retire_tx, _retire_rx) = bounded(16);
        let mut renderer = Renderer::new(24_000, 24_000, retire_tx).unwrap();
        let (tx, rx) = bounded(8);

        // Submitted under generation 1 but pulled before the mixer saw it.
        tx.send(voice(3, 0, 2400, 1)).unwrap();
        renderer.pull(&rx, 0);
        renderer.pull(&rx, 1);
        assert_eq!(renderer.active(), 1);
    }

    #[test]
    fn voice_list_never_grows_past_capacity() {
        let (retire_tx, _retire_rx) = bounded(16);
        let mut renderer = Renderer::new(24_000, 24_000, retire_tx).unwrap();
        let (tx, rx) = bounded(VOICE_CAPACITY + 8);
        for id in 0..(VOICE_CAPACITY + 6) as u64 {
            tx.send(voice(id, id * 2400, 2400, 0)).unwrap();
        }

        renderer.pull(&rx, 0);
        assert_eq!(renderer.active(), VOICE_CAPACITY);
        assert_eq!(rx.len(), 6);
    }
}
