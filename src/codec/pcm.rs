//! Float ⇄ PCM16 little-endian conversion
//!
//! Encoding scales by `i16::MAX` and truncates toward zero; decoding divides
//! by 32768. The asymmetry matches what the backend expects on the wire, so a
//! decode followed by an encode may land one step closer to zero.

use crate::error::CodecError;

/// Bytes per mono PCM16 sample
pub const BYTES_PER_SAMPLE: usize = 2;

const ENCODE_SCALE: f32 = 32767.0;
const DECODE_SCALE: f32 = 32768.0;

/// Encode normalized samples into PCM16 little-endian bytes.
///
/// Samples outside `[-1.0, 1.0]` are clamped. NaN encodes as silence.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    encode_into(samples, &mut out);
    out
}

/// Encode into an existing buffer, appending to it
pub fn encode_into(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * ENCODE_SCALE) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Decode PCM16 little-endian bytes into normalized samples.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    let mut out = Vec::with_capacity(bytes.len() / BYTES_PER_SAMPLE);
    decode_into(bytes, &mut out)?;
    Ok(out)
}

/// Decode into a reusable buffer. The buffer is cleared first.
pub fn decode_into(bytes: &[u8], out: &mut Vec<f32>) -> Result<(), CodecError> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }

    out.clear();
    out.extend(
        bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / DECODE_SCALE),
    );
    Ok(())
}

/// Human-readable summary of a PCM16 payload for diagnostics
pub fn describe(bytes: &[u8], sample_rate: u32) -> String {
    if bytes.is_empty() {
        return "no audio".to_string();
    }

    let samples = bytes.len() / BYTES_PER_SAMPLE;
    let seconds = if sample_rate == 0 {
        0.0
    } else {
        samples as f64 / sample_rate as f64
    };

    format!(
        "{} samples, {:.2}s @ {}Hz, {} bytes",
        samples,
        seconds,
        sample_rate,
        bytes.len()
    )
}
