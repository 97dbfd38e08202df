//! Boundary with the media transport
//!
//! The pipeline is handed an already negotiated bidirectional audio channel:
//! it reads one compressed unit at a time and writes one 20 ms unit at a
//! time. Session setup, ICE and SDP live elsewhere.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod memory;
pub mod webrtc;

pub use memory::{MemorySink, MemorySource, memory_sink, memory_source};
pub use webrtc::{LocalTrackSink, RemoteTrackSource};

/// Inbound compressed audio
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Next payload, or `None` once the track has ended
    async fn read_unit(&mut self) -> Result<Option<Bytes>>;
}

/// Outbound compressed audio
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Send one payload covering `duration` of audio
    async fn write_unit(&mut self, payload: Bytes, duration: Duration) -> Result<()>;
}
