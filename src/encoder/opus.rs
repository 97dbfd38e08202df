use ac_ffmpeg::codec::Encoder;
use ac_ffmpeg::codec::audio::{AudioEncoder, AudioFrameMut};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::Bytes;

use crate::assets::{FRAME_DURATION_MS, MAX_OPUS_PACKET};
use crate::audio::pcm::PcmFormat;
use crate::audio::resample::s16;
use crate::error::{BridgeError, Result};

/// libopus settings tuned for conversational speech
const VOICE_OPTIONS: &[(&str, &str)] = &[
    ("application", "voip"), // Speech-optimised mode
    ("vbr", "on"),           // Variable bitrate
    ("packet_loss", "0"),    // No expected loss, no FEC overhead
];

/// One 20 ms PCM frame in, Opus packets out
pub struct OpusEncoder {
    encoder: AudioEncoder,
    format: PcmFormat,
    layout: ac_ffmpeg::codec::audio::ChannelLayout,
    frame_bytes: usize,
    position: i64,
}

// SAFETY: see `OpusDecoder`.
unsafe impl Send for OpusEncoder {}

impl OpusEncoder {
    pub fn new(format: PcmFormat, bitrate: u64, complexity: u32) -> Result<Self> {
        let mut builder = AudioEncoder::builder("libopus")?
            .sample_rate(format.sample_rate)
            .channel_layout(format.layout.to_ffmpeg()?)
            .sample_format(s16())
            .bit_rate(bitrate)
            .set_option("frame_duration", FRAME_DURATION_MS.to_string())
            .set_option("compression_level", complexity.to_string());
        for (name, value) in VOICE_OPTIONS {
            builder = builder.set_option(name, value);
        }
        let encoder = builder.build()?;

        let expected = format.frame_samples();
        if let Some(samples) = encoder.samples_per_frame()
            && samples != expected
        {
            return Err(BridgeError::FrameSize {
                expected: expected * format.block_align(),
                actual: samples * format.block_align(),
            });
        }

        Ok(Self {
            encoder,
            format,
            layout: format.layout.to_ffmpeg()?,
            frame_bytes: format.frame_bytes(),
            position: 0,
        })
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Encode exactly one frame.
    ///
    /// Wrong-size input and codec failures only affect this frame.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<Vec<Bytes>> {
        if pcm.len() != self.frame_bytes {
            return Err(BridgeError::FrameSize {
                expected: self.frame_bytes,
                actual: pcm.len(),
            });
        }

        let samples = self.format.frame_samples();
        let mut frame = AudioFrameMut::silence(&self.layout, s16(), self.format.sample_rate, samples);
        frame.planes_mut()[0].data_mut()[..pcm.len()].copy_from_slice(pcm);
        let frame = frame
            .with_pts(Timestamp::new(
                self.position,
                TimeBase::new(1, self.format.sample_rate as i32),
            ))
            .freeze();
        self.position += samples as i64;

        let mut packets = Vec::new();
        if let Err(e) = self.encoder.try_push(frame.clone()) {
            if !e.is_again() {
                return Err(e.into());
            }
            // Packets left behind by an earlier failed call
            self.take_packets(&mut packets)?;
            self.encoder.try_push(frame)?;
        }
        self.take_packets(&mut packets)?;
        Ok(packets)
    }

    fn take_packets(&mut self, packets: &mut Vec<Bytes>) -> Result<()> {
        while let Some(packet) = self.encoder.take()? {
            let data = packet.data();
            if data.len() > MAX_OPUS_PACKET {
                log::warn!("Opus packet of {} bytes exceeds limit, dropped", data.len());
                continue;
            }
            packets.push(Bytes::copy_from_slice(data));
        }
        Ok(())
    }
}
