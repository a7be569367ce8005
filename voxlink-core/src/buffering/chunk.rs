//! Typed audio frame passed between capture, codec and playback.

/// A contiguous block of interleaved PCM samples at a known sample rate.
///
/// Both voice paths are mono, so `samples.len()` is the frame count in
/// practice. Frames are immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16000 for capture, 24000 for playback).
    pub sample_rate: u32,
    /// Channel count. Always 1 on the wire.
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Returns true if the frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_counts_frames_not_samples() {
        let mono = AudioFrame::mono(vec![0.0; 2400], 24_000);
        assert!((mono.duration_secs() - 0.1).abs() < 1e-9);

        let stereo = AudioFrame::new(vec![0.0; 4800], 24_000, 2);
        assert_eq!(stereo.frame_count(), 2400);
        assert!((stereo.duration_secs() - 0.1).abs() < 1e-9);
    }
}
