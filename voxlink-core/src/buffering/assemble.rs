//! Fixed-size frame assembly.
//!
//! Device callbacks hand over whatever block size the driver picked. The
//! session contract is a fixed cadence (4096 samples by default), so the
//! worker re-slices the stream here before anything leaves the capture path.

use super::chunk::AudioFrame;

/// Accumulates mono samples and yields frames of exactly `frame_size`.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Append samples and return every frame that became complete.
    ///
    /// A remainder shorter than `frame_size` stays buffered for the next call.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_size;
        if complete == 0 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(complete);
        for block in self.pending.chunks_exact(self.frame_size) {
            frames.push(AudioFrame::mono(block.to_vec(), self.sample_rate));
        }
        self.pending.drain(..complete * self.frame_size);
        frames
    }

    /// Samples waiting for the next full frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_input_yields_nothing() {
        let mut fa = FrameAssembler::new(4096, 16_000);
        assert!(fa.push(&vec![0.1; 1000]).is_empty());
        assert_eq!(fa.pending_len(), 1000);
    }

    #[test]
    fn emits_exact_frames_and_keeps_remainder() {
        let mut fa = FrameAssembler::new(4, 16_000);
        let input: Vec<f32> = (0..10).map(|i| i as f32 / 10.0).collect();
        let frames = fa.push(&input);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.0, 0.1, 0.2, 0.3]);
        assert_eq!(frames[1].samples, vec![0.4, 0.5, 0.6, 0.7]);
        assert!(frames.iter().all(|f| f.sample_rate == 16_000 && f.channels == 1));
        assert_eq!(fa.pending_len(), 2);

        let next = fa.push(&[0.8, 0.9]);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].samples, vec![0.8, 0.9, 0.8, 0.9]);
        assert_eq!(fa.pending_len(), 0);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut fa = FrameAssembler::new(8, 16_000);
        fa.push(&[0.5; 5]);
        fa.reset();
        assert_eq!(fa.pending_len(), 0);
        assert!(fa.push(&[0.5; 3]).is_empty());
    }
}
