//! PCM16 frame codec
//!
//! Converts between normalized `f32` samples and the little-endian
//! 16-bit PCM byte frames exchanged with the speech backend.

pub mod pcm;

pub use pcm::{decode, decode_into, describe, encode, encode_into, BYTES_PER_SAMPLE};
