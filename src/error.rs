//! Error types for the audio core.
//!
//! Collaborator boundaries (transport, AI session, dump sinks) keep using
//! `anyhow::Result`; everything inside the pipeline returns [`BridgeError`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig { key: &'static str, message: String },

    #[error("Unsupported channel layout: {channels} channels")]
    UnsupportedLayout { channels: u16 },

    #[error("Invalid sample rate: {rate}")]
    InvalidSampleRate { rate: u32 },

    #[error("Empty input")]
    EmptyInput,

    #[error("Input of {len} bytes is not a whole number of {block}-byte samples")]
    MisalignedInput { len: usize, block: usize },

    #[error("Frame of {actual} bytes, expected exactly {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Decoded {samples} samples per channel, limit is {max}")]
    OversizedFrame { samples: usize, max: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] ac_ffmpeg::Error),

    #[error("Codec still has output pending: {0}")]
    CodecBusy(String),

    #[error("{0} is closed")]
    ElementClosed(&'static str),

    #[error("{0} inbound queue is full")]
    QueueFull(&'static str),

    #[error("Invalid lifecycle transition for {element}: {from} -> {to}")]
    InvalidState {
        element: &'static str,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid link: {0}")]
    InvalidLink(String),

    #[error("Playout buffer is closed")]
    BufferClosed,

    #[error("Configuration error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<ac_ffmpeg::codec::CodecError> for BridgeError {
    fn from(e: ac_ffmpeg::codec::CodecError) -> Self {
        if e.is_again() {
            return BridgeError::CodecBusy(e.to_string());
        }
        match e.into_inner() {
            Some(inner) => BridgeError::Codec(inner),
            None => BridgeError::CodecBusy(String::from("again")),
        }
    }
}
