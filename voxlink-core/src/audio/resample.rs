//! Sample-rate conversion using rubato's `FastFixedIn` resampler.
//!
//! The wire rates are fixed (16 kHz up, 24 kHz down) but shared-mode
//! drivers usually run at 44.1 or 48 kHz. Two shapes are needed:
//!
//! - [`RateConverter`]: streaming, for the capture worker. Keeps a partial
//!   input block between calls so the output is continuous.
//! - [`convert_block`]: one-shot, for inbound chunks tagged with a rate other
//!   than the playback rate.
//!
//! Both are passthrough when the rates already match. The speaker path uses
//! neither: it keeps one resampler for the lifetime of the stream (see
//! `playback::render`).

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, VoxError};

/// Fixed-ratio mono resampler taking `chunk_size` input frames per call.
pub(crate) fn fixed_ratio(
    from_rate: u32,
    to_rate: u32,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>> {
    let ratio = to_rate as f64 / from_rate as f64;
    FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
    .map_err(|e| VoxError::AudioStream(format!("resampler init: {e}")))
}

/// Streaming mono converter between two fixed sample rates.
pub struct RateConverter {
    /// `None` when the rates match.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds a partial input block between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `VoxError::AudioStream` if rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = fixed_ratio(from_rate, to_rate, chunk_size)?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        debug!(from_rate, to_rate, chunk_size, "streaming resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
        })
    }

    /// Convert what is available; may return an empty vec while a block fills.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let block = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }
        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert one self-contained block.
///
/// The output length is `round(len * to / from)`; rubato's tail is padded
/// or trimmed to that length so back-to-back blocks keep their timing.
pub fn convert_block(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected =
        ((samples.len() as u64 * to_rate as u64 + from_rate as u64 / 2) / from_rate as u64) as usize;
    let mut resampler = fixed_ratio(from_rate, to_rate, samples.len())?;
    let mut output = vec![vec![0f32; resampler.output_frames_max()]; 1];
    let (_consumed, produced) = resampler
        .process_into_buffer(&[samples], &mut output, None)
        .map_err(|e| VoxError::AudioStream(format!("resampler process: {e}")))?;

    let mut out = std::mem::take(&mut output[0]);
    out.truncate(produced);
    out.resize(expected, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_rates_pass_through() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn downsample_48k_to_16k_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={}",
            out.len()
        );
    }

    #[test]
    fn partial_block_is_held_back() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn block_conversion_has_exact_length() {
        // 100 ms at 24 kHz → 100 ms at 48 kHz
        let out = convert_block(&vec![0.25f32; 2400], 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 4800);

        let out = convert_block(&vec![0.25f32; 2400], 24_000, 44_100).unwrap();
        assert_eq!(out.len(), 4410);
    }

    #[test]
    fn block_conversion_passthrough() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(convert_block(&samples, 24_000, 24_000).unwrap(), samples);
        assert!(convert_block(&[], 24_000, 48_000).unwrap().is_empty());
    }
}
