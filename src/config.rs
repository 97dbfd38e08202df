use crate::assets::{
    AI_INPUT_SAMPLE_RATE, AI_OUTPUT_SAMPLE_RATE, DEFAULT_QUEUE_CAPACITY, OPUS_BITRATE,
    OPUS_COMPLEXITY, PRE_ROLL_FRAMES, TRANSPORT_CHANNELS, TRANSPORT_SAMPLE_RATE,
};
use crate::audio::pcm::{ChannelLayout, PcmFormat};
use crate::error::{BridgeError, Result};
use serde::Deserialize;

/// Opus encoder settings for the outbound leg
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub bitrate: u64,
    pub complexity: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate: OPUS_BITRATE,
            complexity: OPUS_COMPLEXITY,
        }
    }
}

/// Which elements forward their raw buffers to a dump sink
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub inbound: bool,
    pub outbound: bool,
}

/// Settings for one bridged call.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub transport_sample_rate: u32,
    pub transport_channels: u16,
    pub ai_input_sample_rate: u32,
    pub ai_output_sample_rate: u32,
    pub queue_capacity: usize,
    pub pre_roll_frames: usize,
    pub encoder: EncoderConfig,
    pub dump: DumpConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport_sample_rate: TRANSPORT_SAMPLE_RATE,
            transport_channels: TRANSPORT_CHANNELS,
            ai_input_sample_rate: AI_INPUT_SAMPLE_RATE,
            ai_output_sample_rate: AI_OUTPUT_SAMPLE_RATE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pre_roll_frames: PRE_ROLL_FRAMES,
            encoder: EncoderConfig::default(),
            dump: DumpConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (key, rate) in [
            ("transport_sample_rate", self.transport_sample_rate),
            ("ai_input_sample_rate", self.ai_input_sample_rate),
            ("ai_output_sample_rate", self.ai_output_sample_rate),
        ] {
            if rate == 0 {
                return Err(BridgeError::InvalidConfig {
                    key,
                    message: "sample rate must be positive".into(),
                });
            }
        }
        ChannelLayout::from_channels(self.transport_channels)?;
        if self.queue_capacity == 0 {
            return Err(BridgeError::InvalidConfig {
                key: "queue_capacity",
                message: "queues must be bounded and non-empty".into(),
            });
        }
        if self.pre_roll_frames == 0 {
            return Err(BridgeError::InvalidConfig {
                key: "pre_roll_frames",
                message: "at least one frame of pre-roll is required".into(),
            });
        }
        if self.encoder.complexity > 10 {
            return Err(BridgeError::InvalidConfig {
                key: "encoder.complexity",
                message: format!("{} is outside 0..=10", self.encoder.complexity),
            });
        }
        Ok(())
    }

    pub fn transport_format(&self) -> Result<PcmFormat> {
        PcmFormat::new(self.transport_sample_rate, self.transport_channels)
    }

    pub fn ai_input_format(&self) -> Result<PcmFormat> {
        PcmFormat::new(self.ai_input_sample_rate, 1)
    }

    pub fn ai_output_format(&self) -> Result<PcmFormat> {
        PcmFormat::new(self.ai_output_sample_rate, 1)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
