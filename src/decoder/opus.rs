use ac_ffmpeg::codec::audio::AudioDecoder;
use ac_ffmpeg::codec::{AudioCodecParameters, Decoder};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::{Bytes, BytesMut};

use crate::audio::pcm::PcmFormat;
use crate::audio::resample::FrameConverter;
use crate::error::{BridgeError, Result};

/// Upper bound on decoded samples per channel for one packet (40 ms at 48 kHz)
pub const MAX_DECODED_SAMPLES: usize = 1920;

/// Opus packet to packed s16 PCM in a fixed output format
pub struct OpusDecoder {
    decoder: AudioDecoder,
    converter: FrameConverter,
    output: PcmFormat,
    time_base: TimeBase,
    /// Samples per channel decoded so far, stamped on the next packet
    position: i64,
}

// SAFETY: the codec context is owned by a single element worker and only
// used through `&mut self`.
unsafe impl Send for OpusDecoder {}

impl OpusDecoder {
    /// Decoder set up for `output`, so mono or stereo 48 kHz comes out
    /// without a channel or rate conversion.
    pub fn new(output: PcmFormat) -> Result<Self> {
        let layout = output.layout.to_ffmpeg()?;
        let time_base = TimeBase::new(1, output.sample_rate as i32);
        // The decoder is picked by codec id: libopus when FFmpeg prefers it,
        // the built-in one otherwise
        let parameters = AudioCodecParameters::builder("opus")?
            .sample_rate(output.sample_rate)
            .channel_layout(&layout)
            .build();
        let decoder = AudioDecoder::from_codec_parameters(&parameters)?
            .time_base(time_base)
            .build()?;

        Ok(Self {
            decoder,
            converter: FrameConverter::new(output),
            output,
            time_base,
            position: 0,
        })
    }

    pub fn output_format(&self) -> PcmFormat {
        self.output
    }

    /// Decode one packet.
    ///
    /// An error only concerns this packet; the decoder stays usable.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.is_empty() {
            return Err(BridgeError::EmptyInput);
        }

        // Leftovers from a failed packet would make push report "again"
        while let Ok(Some(_)) = self.decoder.take() {}

        let packet = PacketMut::from(packet)
            .with_time_base(self.time_base)
            .with_pts(Timestamp::new(self.position, self.time_base))
            .freeze();
        self.decoder.try_push(packet)?;

        let mut pcm = BytesMut::new();
        while let Some(frame) = self.decoder.take()? {
            let samples = frame.samples();
            if samples == 0 {
                continue;
            }
            self.position += samples as i64;
            if samples > MAX_DECODED_SAMPLES {
                return Err(BridgeError::OversizedFrame {
                    samples,
                    max: MAX_DECODED_SAMPLES,
                });
            }
            self.converter.convert(frame, &mut pcm)?;
        }
        Ok(pcm.freeze())
    }
}
