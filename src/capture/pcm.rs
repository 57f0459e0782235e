//! Float-to-PCM conversion for one processing quantum.
//!
//! Runs inside the real-time capture loop: synchronous, one allocation per
//! quantum, nothing else.

/// Convert one float sample to signed 16-bit PCM.
///
/// Samples are clamped to [-1, 1] first (upstream gain artifacts can
/// overshoot), then scaled by 32767 and rounded.
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Convert one quantum of float samples to little-endian i16 PCM bytes.
pub fn quantum_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&sample_to_i16(s).to_le_bytes());
    }
    out
}
