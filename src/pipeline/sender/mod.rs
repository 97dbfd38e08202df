//! Outbound leg elements
//!
//! ```text
//! AI → Playout → OpusEncode → TransportSink → Transport
//! ```

pub mod encode_stage;
pub mod playout_stage;
pub mod transmit_stage;

pub use encode_stage::OpusEncodeElement;
pub use playout_stage::PlayoutElement;
pub use transmit_stage::TransportSinkElement;
