//! Audio decoding
//!
//! Opus packets from the transport are decoded via FFmpeg and handed on as
//! packed 16-bit PCM.

mod opus;

pub use opus::{MAX_DECODED_SAMPLES, OpusDecoder};
