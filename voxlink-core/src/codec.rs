//! Frame codec: f32 samples ⇄ 16-bit little-endian PCM ⇄ base64 wire text.
//!
//! Pure functions, no state. The quantisation step is `1 / 32768`, which is
//! the round-trip error bound for every sample in [-1.0, 1.0].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{
    buffering::chunk::AudioFrame,
    error::{Result, VoxError},
};

/// Scale between normalised floats and i16 PCM.
pub const PCM16_SCALE: f32 = 32768.0;

/// Base64-wrapped 16-bit LE PCM, ready for the transport.
///
/// The decoded payload always holds `2 * sample_count` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    /// Base64 text of the PCM bytes.
    pub data: String,
    /// Declared sample rate of the payload (Hz).
    pub sample_rate: u32,
}

impl EncodedChunk {
    pub fn new(data: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            sample_rate,
        }
    }

    /// Wrap raw PCM bytes.
    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        Self::new(STANDARD.encode(bytes), sample_rate)
    }

    /// Undo the text wrapping.
    pub fn pcm_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| VoxError::MalformedChunk(format!("invalid base64: {e}")))
    }

    /// MIME type the live endpoint expects for this payload.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Quantise one sample. NaN maps to 0, out-of-range input saturates.
#[inline]
pub fn quantize(sample: f32) -> i16 {
    (sample * PCM16_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert samples to little-endian i16 bytes.
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&quantize(s).to_le_bytes());
    }
    out
}

/// Convert little-endian i16 bytes to samples.
///
/// # Errors
/// `VoxError::MalformedChunk` when the byte count is odd.
pub fn pcm16_to_samples(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoxError::MalformedChunk(format!(
            "odd PCM byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Encode a frame for the wire.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    EncodedChunk::from_pcm_bytes(&samples_to_pcm16(&frame.samples), frame.sample_rate)
}

/// Decode a wire chunk into a frame with `channel_count` interleaved channels.
///
/// # Errors
/// `VoxError::MalformedChunk` on invalid base64, an odd byte count, or a
/// sample count that does not divide evenly into `channel_count`.
pub fn decode(chunk: &EncodedChunk, channel_count: u16) -> Result<AudioFrame> {
    let channels = channel_count.max(1);
    let bytes = chunk.pcm_bytes()?;
    let samples = pcm16_to_samples(&bytes)?;
    if samples.len() % channels as usize != 0 {
        return Err(VoxError::MalformedChunk(format!(
            "{} samples do not split into {channels} channels",
            samples.len()
        )));
    }
    Ok(AudioFrame::new(samples, chunk.sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_trip_is_within_one_quantum() {
        let samples: Vec<f32> = (0..4096)
            .map(|i| ((i as f32) * 0.013).sin() * 0.97)
            .chain([-1.0, 1.0, 0.0, 1.0 / 65536.0, -0.999_99])
            .collect();
        let frame = AudioFrame::mono(samples.clone(), 16_000);

        let chunk = encode(&frame);
        assert_eq!(chunk.pcm_bytes().unwrap().len(), 2 * samples.len());

        let back = decode(&chunk, 1).unwrap();
        assert_eq!(back.sample_rate, 16_000);
        assert_eq!(back.samples.len(), samples.len());
        for (a, b) in samples.iter().zip(&back.samples) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1.0 / 32768.0);
            assert!(b.is_finite());
        }
    }

    #[test]
    fn positive_full_scale_clamps() {
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(3.5), i16::MAX);
        assert_eq!(quantize(-7.0), i16::MIN);
    }

    #[test]
    fn non_finite_input_never_leaks() {
        assert_eq!(quantize(f32::NAN), 0);
        assert_eq!(quantize(f32::INFINITY), i16::MAX);
        assert_eq!(quantize(f32::NEG_INFINITY), i16::MIN);
    }

    #[test]
    fn little_endian_layout() {
        // 0.5 * 32768 = 16384 = 0x4000
        assert_eq!(samples_to_pcm16(&[0.5]), vec![0x00, 0x40]);
        // -1 * 32768 = -32768 = 0x8000
        assert_eq!(samples_to_pcm16(&[-1.0]), vec![0x00, 0x80]);
    }

    #[test]
    fn odd_byte_length_is_malformed() {
        let chunk = EncodedChunk::from_pcm_bytes(&[0x01, 0x02, 0x03], 24_000);
        assert!(matches!(decode(&chunk, 1), Err(VoxError::MalformedChunk(_))));
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let chunk = EncodedChunk::new("not base64!!", 24_000);
        assert!(matches!(decode(&chunk, 1), Err(VoxError::MalformedChunk(_))));
    }

    #[test]
    fn channel_mismatch_is_malformed() {
        let chunk = EncodedChunk::from_pcm_bytes(&[0, 0, 0, 0, 0, 0], 24_000);
        assert!(matches!(decode(&chunk, 2), Err(VoxError::MalformedChunk(_))));
        assert_eq!(decode(&chunk, 1).unwrap().samples.len(), 3);
    }

    #[test]
    fn mime_type_declares_rate() {
        let chunk = encode(&AudioFrame::mono(vec![0.0; 4], 16_000));
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
    }
}
