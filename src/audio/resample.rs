//! Sample rate and channel conversion on top of libswresample.
//!
//! [`Resampler`] converts packed s16 PCM between two fixed formats. Each call
//! returns about `round(n * out / in)` samples; the count is worked out from
//! the running input total, so rounding never accumulates across calls. The
//! converter keeps its filter history between calls, and whatever it holds
//! back is carried into the next call instead of being lost.

use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioFrame, AudioFrameMut, AudioResampler, SampleFormat};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::{Bytes, BytesMut};
use std::fmt;

use super::pcm::PcmFormat;
use crate::error::{BridgeError, Result};

/// Packed signed 16-bit, the only sample format that crosses element boundaries
pub(crate) fn s16() -> SampleFormat {
    get_sample_format("s16")
}

/// Expected output samples per channel for `samples` input samples
pub fn output_samples(samples: usize, input_rate: u32, output_rate: u32) -> usize {
    let input_rate = input_rate as u64;
    ((samples as u64 * output_rate as u64 + input_rate / 2) / input_rate) as usize
}

/// Converts s16 PCM from one (rate, layout) to another
pub struct Resampler {
    input: PcmFormat,
    output: PcmFormat,
    context: AudioResampler,
    source_layout: ac_ffmpeg::codec::audio::ChannelLayout,
    /// Converted bytes not yet handed out
    pending: BytesMut,
    /// Input samples pushed so far, used as the frame pts
    position: i64,
    /// Output samples handed out so far
    emitted: usize,
}

// SAFETY: the swresample context is only touched through `&mut self`, and the
// owning element never shares it between tasks.
unsafe impl Send for Resampler {}

impl Resampler {
    pub fn new(input: PcmFormat, output: PcmFormat) -> Result<Self> {
        for rate in [input.sample_rate, output.sample_rate] {
            if rate == 0 || rate > i32::MAX as u32 {
                return Err(BridgeError::InvalidSampleRate { rate });
            }
        }

        Ok(Self {
            input,
            output,
            context: build_context(input, output)?,
            source_layout: input.layout.to_ffmpeg()?,
            pending: BytesMut::new(),
            position: 0,
            emitted: 0,
        })
    }

    pub fn input_format(&self) -> PcmFormat {
        self.input
    }

    pub fn output_format(&self) -> PcmFormat {
        self.output
    }

    /// Output samples per channel converted but not handed out yet
    pub fn pending_samples(&self) -> usize {
        self.pending.len() / self.output.block_align()
    }

    /// Forget all history, as if freshly built.
    ///
    /// Used on discontinuities so the tail of the old stream does not leak
    /// into the next one.
    pub fn reset(&mut self) -> Result<()> {
        self.context = build_context(self.input, self.output)?;
        self.pending.clear();
        self.position = 0;
        self.emitted = 0;
        Ok(())
    }

    /// Convert one chunk of interleaved PCM.
    ///
    /// Fails on empty input and on input that is not a whole number of
    /// input samples.
    pub fn convert(&mut self, pcm: &[u8]) -> Result<Bytes> {
        if pcm.is_empty() {
            return Err(BridgeError::EmptyInput);
        }
        let samples = self.input.check_aligned(pcm.len())?;
        let block = self.output.block_align();

        let mut frame = AudioFrameMut::silence(
            &self.source_layout,
            s16(),
            self.input.sample_rate,
            samples,
        );
        frame.planes_mut()[0].data_mut()[..pcm.len()].copy_from_slice(pcm);
        let frame = frame
            .with_pts(Timestamp::new(
                self.position,
                TimeBase::new(1, self.input.sample_rate as i32),
            ))
            .freeze();
        push_frame(&mut self.context, frame, &mut self.pending, block)?;
        self.position += samples as i64;

        let total = output_samples(
            self.position as usize,
            self.input.sample_rate,
            self.output.sample_rate,
        );
        let expected = (total - self.emitted) * block;
        self.emitted = total;

        if self.pending.len() >= expected {
            return Ok(self.pending.split_to(expected).freeze());
        }

        // Only the filter delay of the first calls ends up here
        let mut out = BytesMut::zeroed(expected - self.pending.len());
        out.extend_from_slice(&self.pending.split());
        Ok(out.freeze())
    }
}

fn build_context(input: PcmFormat, output: PcmFormat) -> Result<AudioResampler> {
    let context = AudioResampler::builder()
        .source_channel_layout(input.layout.to_ffmpeg()?)
        .source_sample_format(s16())
        .source_sample_rate(input.sample_rate)
        .target_channel_layout(output.layout.to_ffmpeg()?)
        .target_sample_format(s16())
        .target_sample_rate(output.sample_rate)
        .target_frame_samples(None)
        .build()?;
    Ok(context)
}

/// Push one frame and collect everything the converter has ready.
///
/// Output left over from an earlier failed call makes the push report
/// "again"; that output is collected first and the push retried.
fn push_frame(
    context: &mut AudioResampler,
    frame: AudioFrame,
    out: &mut BytesMut,
    block: usize,
) -> Result<()> {
    if let Err(e) = context.try_push(frame.clone()) {
        if !e.is_again() {
            return Err(e.into());
        }
        take_all(context, out, block)?;
        context.try_push(frame)?;
    }
    take_all(context, out, block)
}

fn take_all(context: &mut AudioResampler, out: &mut BytesMut, block: usize) -> Result<()> {
    while let Some(converted) = context.take()? {
        append_packed(out, &converted, block);
    }
    Ok(())
}

/// Converts decoder output of any shape into packed s16 of a fixed format.
///
/// Frames already in the target format are copied as-is; anything else goes
/// through a converter that is rebuilt whenever the source shape changes.
/// Decoder frames are restamped with a running sample position before they
/// reach the converter, since one without a usable pts would be treated as
/// overlapping and dropped.
pub(crate) struct FrameConverter {
    target: PcmFormat,
    context: Option<(SourceShape, AudioResampler)>,
    /// Source samples pushed into the current context
    position: i64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct SourceShape {
    channels: u32,
    format: SampleFormat,
    rate: u32,
}

impl fmt::Debug for SourceShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceShape")
            .field("channels", &self.channels)
            .field("format", &self.format.name())
            .field("rate", &self.rate)
            .finish()
    }
}

// SAFETY: see `Resampler`.
unsafe impl Send for FrameConverter {}

impl FrameConverter {
    pub(crate) fn new(target: PcmFormat) -> Self {
        Self {
            target,
            context: None,
            position: 0,
        }
    }

    pub(crate) fn convert(&mut self, frame: AudioFrame, out: &mut BytesMut) -> Result<()> {
        let shape = SourceShape {
            channels: frame.channel_layout().channels(),
            format: frame.sample_format(),
            rate: frame.sample_rate(),
        };
        let block = self.target.block_align();

        if shape.channels == self.target.channels() as u32
            && shape.format == s16()
            && shape.rate == self.target.sample_rate
        {
            append_packed(out, &frame, block);
            return Ok(());
        }

        let rebuild = !matches!(&self.context, Some((current, _)) if *current == shape);
        if rebuild {
            log::debug!("Converting decoder output from {:?}", shape);
            let context = AudioResampler::builder()
                .source_channel_layout(frame.channel_layout().to_owned())
                .source_sample_format(shape.format)
                .source_sample_rate(shape.rate)
                .target_channel_layout(self.target.layout.to_ffmpeg()?)
                .target_sample_format(s16())
                .target_sample_rate(self.target.sample_rate)
                .target_frame_samples(None)
                .build()?;
            self.context = Some((shape, context));
            self.position = 0;
        }

        if let Some((_, context)) = self.context.as_mut() {
            let samples = frame.samples() as i64;
            let frame = frame.with_pts(Timestamp::new(
                self.position,
                TimeBase::new(1, shape.rate as i32),
            ));
            push_frame(context, frame, out, block)?;
            self.position += samples;
        }
        Ok(())
    }
}

fn append_packed(out: &mut BytesMut, frame: &AudioFrame, block: usize) {
    let planes = frame.planes();
    if let Some(plane) = planes.first() {
        let data = plane.data();
        let len = (frame.samples() * block).min(data.len());
        out.extend_from_slice(&data[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{bytes_to_samples, is_silence, samples_to_bytes};

    fn tone(samples: usize, rate: u32) -> Vec<u8> {
        let pcm: Vec<i16> = (0..samples)
            .map(|i| {
                let t = i as f32 / rate as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16
            })
            .collect();
        samples_to_bytes(&pcm)
    }

    #[test]
    fn test_output_sample_rounding() {
        assert_eq!(output_samples(480, 24_000, 48_000), 960);
        assert_eq!(output_samples(960, 48_000, 16_000), 320);
        assert_eq!(output_samples(100, 48_000, 16_000), 33);
        assert_eq!(output_samples(101, 48_000, 16_000), 34);
    }

    #[test]
    fn test_upsample_length_and_content() {
        let input = PcmFormat::new(24_000, 1).unwrap();
        let output = PcmFormat::new(48_000, 1).unwrap();
        let mut resampler = Resampler::new(input, output).unwrap();

        let converted = resampler.convert(&tone(480, 24_000)).unwrap();
        assert_eq!(converted.len(), output.frame_bytes());
        assert!(!is_silence(&converted));
    }

    #[test]
    fn test_round_trip_preserves_length() {
        let high = PcmFormat::new(48_000, 1).unwrap();
        let low = PcmFormat::new(16_000, 1).unwrap();
        let mut down = Resampler::new(high, low).unwrap();
        let mut up = Resampler::new(low, high).unwrap();

        for samples in [960usize, 480, 100, 3, 4410] {
            let silence = vec![0u8; samples * 2];
            let reduced = down.convert(&silence).unwrap();
            let reduced_samples = reduced.len() / 2;
            assert!(reduced_samples.abs_diff(output_samples(samples, 48_000, 16_000)) <= 1);

            let restored = up.convert(&reduced).unwrap();
            let restored_samples = restored.len() / 2;
            assert!(
                restored_samples.abs_diff(samples) <= 1,
                "{} samples came back as {}",
                samples,
                restored_samples
            );
        }
    }

    #[test]
    fn test_channel_change_scales_bytes() {
        let mono = PcmFormat::new(24_000, 1).unwrap();
        let stereo = PcmFormat::new(48_000, 2).unwrap();
        let mut resampler = Resampler::new(mono, stereo).unwrap();

        let converted = resampler.convert(&tone(480, 24_000)).unwrap();
        assert_eq!(converted.len(), 960 * 4);
        assert_eq!(bytes_to_samples(&converted).len(), 1920);
    }

    #[test]
    fn test_rejects_bad_input() {
        let stereo = PcmFormat::new(48_000, 2).unwrap();
        let mono = PcmFormat::new(16_000, 1).unwrap();
        let mut resampler = Resampler::new(stereo, mono).unwrap();

        assert!(matches!(resampler.convert(&[]), Err(BridgeError::EmptyInput)));
        assert!(matches!(
            resampler.convert(&[0u8; 6]),
            Err(BridgeError::MisalignedInput { len: 6, block: 4 })
        ));
        // Still usable after a rejected call
        assert_eq!(resampler.convert(&[0u8; 12]).unwrap().len(), 2);
    }

    #[test]
    fn test_odd_chunks_do_not_drift() {
        let high = PcmFormat::new(48_000, 1).unwrap();
        let low = PcmFormat::new(16_000, 1).unwrap();
        let mut down = Resampler::new(high, low).unwrap();

        let mut fed = 0usize;
        let mut produced = 0usize;
        for round in 0..400 {
            let samples = [100usize, 37, 961, 3, 479][round % 5];
            let out = down.convert(&tone(samples, 48_000)).unwrap();
            fed += samples;
            produced += out.len() / 2;

            let ideal = fed as f64 / 3.0;
            assert!(
                (produced as f64 - ideal).abs() <= 1.0,
                "{} samples out after {} in",
                produced,
                fed
            );
            assert!(down.pending_samples() <= low.frame_samples());
        }
    }

    #[test]
    fn test_unconsumed_output_is_kept() {
        let input = PcmFormat::new(48_000, 1).unwrap();
        let output = PcmFormat::new(16_000, 1).unwrap();
        let mut resampler = Resampler::new(input, output).unwrap();

        // Output left in the converter, as after a failed take
        let layout = input.layout.to_ffmpeg().unwrap();
        let frame = AudioFrameMut::silence(&layout, s16(), 48_000, 960)
            .with_pts(Timestamp::new(0, TimeBase::new(1, 48_000)))
            .freeze();
        resampler.context.push(frame).unwrap();
        resampler.position = 960;
        resampler.emitted = 320;

        let out = resampler.convert(&tone(960, 48_000)).unwrap();
        assert_eq!(out.len(), output.frame_bytes());
        // The stranded frame is waiting to go out next
        assert!(resampler.pending_samples() >= 160);
    }

    #[test]
    fn test_reset_forgets_history() {
        let input = PcmFormat::new(24_000, 1).unwrap();
        let output = PcmFormat::new(48_000, 1).unwrap();
        let mut used = Resampler::new(input, output).unwrap();
        let mut fresh = Resampler::new(input, output).unwrap();

        for samples in [480usize, 13, 250] {
            used.convert(&tone(samples, 24_000)).unwrap();
        }
        used.reset().unwrap();
        assert_eq!(used.pending_samples(), 0);

        let chunk = tone(480, 24_000);
        assert_eq!(used.convert(&chunk).unwrap(), fresh.convert(&chunk).unwrap());
    }

    #[test]
    fn test_converter_keeps_every_decoder_frame() {
        use ac_ffmpeg::codec::audio::ChannelLayout;

        // Stereo frames with no pts, like a decoder left at its defaults
        let stereo = ChannelLayout::from_channels(2).unwrap();
        let target = PcmFormat::new(48_000, 1).unwrap();
        let mut converter = FrameConverter::new(target);

        let mut out = BytesMut::new();
        for _ in 0..10 {
            let frame = AudioFrameMut::silence(&stereo, s16(), 48_000, 960).freeze();
            converter.convert(frame, &mut out).unwrap();
        }
        let samples = out.len() / target.block_align();
        assert!(
            samples.abs_diff(10 * 960) <= 64,
            "{} samples out of 10 frames",
            samples
        );
    }

    #[test]
    fn test_rejects_zero_rate() {
        let good = PcmFormat::new(16_000, 1).unwrap();
        let zero = PcmFormat {
            sample_rate: 0,
            layout: good.layout,
        };
        assert!(matches!(
            Resampler::new(zero, good),
            Err(BridgeError::InvalidSampleRate { rate: 0 })
        ));
    }
}
