//! Boundary with the streaming conversational AI backend
//!
//! The bridge sends 16 kHz PCM chunks up and receives text, 24 kHz PCM and
//! interruption signals back. The backend's own session protocol stays on
//! the far side of [`AiSession`].

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub mod echo;

pub use echo::EchoSession;

/// One chunk of uplink audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Bytes,
    pub mime_type: &'static str,
    pub sample_rate: u32,
}

/// Something the backend said
#[derive(Debug, Clone)]
pub enum AiMessage {
    /// Transcript or model text; passed downstream untouched
    Text(String),
    /// Inline PCM, mono s16le
    Audio { data: Bytes, sample_rate: u32 },
    /// The user spoke over the model; anything not yet played is stale
    Interrupted,
    /// The model finished its turn
    TurnComplete,
}

/// Live session with the backend.
///
/// Uplink and downlink run on separate tasks, so both methods take `&self`.
#[async_trait]
pub trait AiSession: Send + Sync {
    async fn send_audio(&self, chunk: AudioChunk) -> Result<()>;

    /// Next message, or `None` once the session has ended
    async fn receive(&self) -> Result<Option<AiMessage>>;

    /// No more audio will be sent. The backend may still finish its reply.
    async fn end_input(&self) -> Result<()> {
        Ok(())
    }
}
