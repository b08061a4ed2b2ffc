//! PCM16 frame codec
//!
//! Converts between floating-point samples and 16-bit little-endian PCM, and
//! between raw PCM bytes and the base64 text the realtime protocol carries.
//!
//! The float → PCM16 mapping is deliberately asymmetric: negative samples scale
//! by 32768 and non-negative samples by 32767, truncating toward zero. The
//! service expects exactly this quantization, so do not "fix" it.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::VoiceError;

/// Stateless PCM16 / transport-text codec.
///
/// Safe to call from the capture callback and the playback context at once.
pub struct FrameCodec;

impl FrameCodec {
    /// Float samples (nominally -1.0..=1.0) to PCM16 little-endian bytes
    pub fn encode(samples: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            bytes.extend_from_slice(&float_to_pcm16(sample).to_le_bytes());
        }
        bytes
    }

    /// PCM16 little-endian bytes to float samples
    ///
    /// Fails with `DecodeError` on an odd byte count.
    pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, VoiceError> {
        if bytes.len() % 2 != 0 {
            return Err(VoiceError::DecodeError(format!(
                "PCM16 payload has odd length {}",
                bytes.len()
            )));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|pair| {
                let value = u16::from_le_bytes([pair[0], pair[1]]) as i32;
                if value < 32768 {
                    value as f32 / 32768.0
                } else {
                    (value - 65536) as f32 / 32768.0
                }
            })
            .collect())
    }

    /// PCM bytes to standard base64
    pub fn to_transport_text(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    /// Standard base64 to PCM bytes
    pub fn from_transport_text(text: &str) -> Result<Vec<u8>, VoiceError> {
        STANDARD
            .decode(text)
            .map_err(|e| VoiceError::DecodeError(format!("invalid base64: {}", e)))
    }
}

fn float_to_pcm16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// RMS level of a frame, 0.0 for an empty frame.
///
/// Diagnostic only; capture never gates on it.
pub fn frame_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
