//! Inbound leg elements
//!
//! ```text
//! Transport → TransportSource → OpusDecode → AudioResample → AI
//! ```

pub mod decode_stage;
pub mod receive_stage;
pub mod resample_stage;

pub use decode_stage::OpusDecodeElement;
pub use receive_stage::TransportSourceElement;
pub use resample_stage::AudioResampleElement;
