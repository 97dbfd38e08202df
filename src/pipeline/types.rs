//! Core types for the pipeline system

use bytes::Bytes;
use std::time::{Duration, Instant};

use crate::assets::{MIME_OPUS, MIME_RAW_PCM};
use crate::audio::pcm::PcmFormat;
use crate::error::Result;

/// Timestamp representation for media frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    /// Microseconds since pipeline start
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Convert to duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Encoding of an audio payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// Packed signed 16-bit little-endian PCM
    RawPcm,
    /// One Opus packet
    Opus,
    /// Anything else; every element ignores it
    Other,
}

impl MediaType {
    pub fn mime(&self) -> &'static str {
        match self {
            MediaType::RawPcm => MIME_RAW_PCM,
            MediaType::Opus => MIME_OPUS,
            MediaType::Other => "application/octet-stream",
        }
    }

    pub fn from_mime(mime: &str) -> Self {
        match mime {
            MIME_RAW_PCM => MediaType::RawPcm,
            MIME_OPUS => MediaType::Opus,
            _ => MediaType::Other,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mime())
    }
}

/// One unit of audio travelling between elements
#[derive(Clone)]
pub struct AudioData {
    pub data: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
    pub media_type: MediaType,
    pub codec: &'static str,
    pub captured_at: Instant,
    /// Response turn of the AI backend this audio belongs to; a higher turn
    /// invalidates everything buffered from earlier turns
    pub turn: u64,
}

impl AudioData {
    /// Raw PCM in `format`; the payload must hold whole samples
    pub fn pcm(data: Bytes, format: PcmFormat) -> Result<Self> {
        format.check_aligned(data.len())?;
        Ok(Self {
            data,
            sample_rate: format.sample_rate,
            channels: format.channels(),
            media_type: MediaType::RawPcm,
            codec: "pcm_s16le",
            captured_at: Instant::now(),
            turn: 0,
        })
    }

    /// One compressed Opus packet
    pub fn opus(data: Bytes, sample_rate: u32, channels: u16) -> Self {
        Self {
            data,
            sample_rate,
            channels,
            media_type: MediaType::Opus,
            codec: "opus",
            captured_at: Instant::now(),
            turn: 0,
        }
    }

    pub fn with_turn(mut self, turn: u64) -> Self {
        self.turn = turn;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for AudioData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioData")
            .field("media_type", &self.media_type)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("turn", &self.turn)
            .field("size", &self.size())
            .finish()
    }
}

/// Raw video; carried so mixed streams can share a pipeline, never processed here
#[derive(Clone)]
pub struct VideoData {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl std::fmt::Debug for VideoData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoData")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TextData {
    pub text: String,
    pub captured_at: Instant,
}

/// Message exchanged over element queues
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Audio(AudioData),
    Video(VideoData),
    Text(TextData),
}

impl StreamMessage {
    pub fn text(text: impl Into<String>) -> Self {
        StreamMessage::Text(TextData {
            text: text.into(),
            captured_at: Instant::now(),
        })
    }

    /// The audio payload, if this is non-empty audio of the given media type.
    ///
    /// Elements use this as their input filter and silently skip the rest.
    pub fn into_audio(self, media_type: MediaType) -> Option<AudioData> {
        match self {
            StreamMessage::Audio(audio)
                if audio.media_type == media_type && !audio.data.is_empty() =>
            {
                Some(audio)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Audio(_) => "audio",
            StreamMessage::Video(_) => "video",
            StreamMessage::Text(_) => "text",
        }
    }
}

impl From<AudioData> for StreamMessage {
    fn from(audio: AudioData) -> Self {
        StreamMessage::Audio(audio)
    }
}
