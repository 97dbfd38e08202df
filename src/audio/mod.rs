//! PCM handling shared by the pipeline elements
//!
//! - `pcm`: sample/byte helpers and the 20 ms frame arithmetic
//! - `resample`: rate and channel conversion
//! - `playout`: the fixed-cadence playout buffer

pub mod pcm;
pub mod playout;
pub mod resample;

pub use pcm::{ChannelLayout, PcmFormat};
pub use playout::{PlayoutBuffer, PlayoutState};
pub use resample::Resampler;
