//! Audio encoding for the outbound leg

mod opus;

pub use opus::OpusEncoder;
