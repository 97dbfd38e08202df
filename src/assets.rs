use std::time::Duration;

// timing
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const FRAME_DURATION_MS: u32 = 20;

// sample rates
pub const TRANSPORT_SAMPLE_RATE: u32 = 48_000;
pub const TRANSPORT_CHANNELS: u16 = 1;
pub const AI_INPUT_SAMPLE_RATE: u32 = 16_000;
pub const AI_OUTPUT_SAMPLE_RATE: u32 = 24_000;

// playout
pub const PRE_ROLL_FRAMES: usize = 5;

// opus
pub const OPUS_BITRATE: u64 = 64_000;
pub const OPUS_COMPLEXITY: u32 = 10;
pub const MAX_OPUS_PACKET: usize = 1275;

// queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const EVENT_QUEUE_CAPACITY: usize = 100;

// a unit source failing this many times in a row is treated as gone
pub const MAX_CONSECUTIVE_FAILURES: u32 = 50;

pub const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub const MIME_RAW_PCM: &str = "audio/x-raw";
pub const MIME_OPUS: &str = "audio/x-opus";
pub const MIME_AI_PCM: &str = "audio/pcm";
