//! 16-bit little-endian PCM helpers

use crate::assets::FRAME_DURATION_MS;
use crate::error::{BridgeError, Result};

/// Bytes per sample for signed 16-bit PCM
pub const BYTES_PER_SAMPLE: usize = 2;

/// Channel layouts supported by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn from_channels(channels: u16) -> Result<Self> {
        match channels {
            1 => Ok(ChannelLayout::Mono),
            2 => Ok(ChannelLayout::Stereo),
            _ => Err(BridgeError::UnsupportedLayout { channels }),
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }

    /// ffmpeg layout with the same channel count
    pub(crate) fn to_ffmpeg(self) -> Result<ac_ffmpeg::codec::audio::ChannelLayout> {
        ac_ffmpeg::codec::audio::ChannelLayout::from_channels(self.channels() as u32).ok_or(
            BridgeError::UnsupportedLayout {
                channels: self.channels(),
            },
        )
    }
}

/// Sample rate plus channel layout of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub layout: ChannelLayout,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 {
            return Err(BridgeError::InvalidSampleRate { rate: sample_rate });
        }
        Ok(Self {
            sample_rate,
            layout: ChannelLayout::from_channels(channels)?,
        })
    }

    pub fn channels(&self) -> u16 {
        self.layout.channels()
    }

    /// Size of one interleaved sample across all channels
    pub fn block_align(&self) -> usize {
        BYTES_PER_SAMPLE * self.channels() as usize
    }

    /// Samples per channel in one 20 ms frame
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate * FRAME_DURATION_MS / 1000) as usize
    }

    /// Bytes in one 20 ms frame
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * self.block_align()
    }

    /// Checks that `len` holds a whole number of interleaved samples
    pub fn check_aligned(&self, len: usize) -> Result<usize> {
        let block = self.block_align();
        if len % block != 0 {
            return Err(BridgeError::MisalignedInput { len, block });
        }
        Ok(len / block)
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels())
    }
}

pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub fn is_silence(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}
