//! Resample stage: transport-rate PCM down to the rate the AI expects

use async_trait::async_trait;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::audio::pcm::PcmFormat;
use crate::audio::resample::Resampler;
use crate::error::Result;
use crate::pipeline::element::{Element, ElementCore, Ports, emit, next_message};
use crate::pipeline::types::{AudioData, MediaType};

pub struct AudioResampleElement {
    core: ElementCore,
    input: PcmFormat,
    output: PcmFormat,
}

impl AudioResampleElement {
    pub fn new(input: PcmFormat, output: PcmFormat, capacity: usize) -> Self {
        Self {
            core: ElementCore::new("AudioResample", capacity),
            input,
            output,
        }
    }
}

#[async_trait]
impl Element for AudioResampleElement {
    crate::delegate_element_core!();

    async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        self.core.ensure_idle()?;
        let mut resampler = Resampler::new(self.input, self.output)?;
        let Ports {
            mut inbound,
            outbound,
            cancel,
        } = self.core.begin(&lifetime)?;

        let health = self.core.health();
        let (input, output) = (self.input, self.output);
        info!("AudioResample: {} -> {}", input, output);

        self.core.spawn(async move {
            while let Some(msg) = next_message(&mut inbound, &cancel).await {
                let Some(audio) = msg.into_audio(MediaType::RawPcm) else {
                    health.record_filtered();
                    continue;
                };
                if audio.sample_rate != input.sample_rate || audio.channels != input.channels() {
                    health.record_filtered();
                    warn!(
                        "AudioResample: skipping {} Hz/{} ch buffer, expected {}",
                        audio.sample_rate, audio.channels, input
                    );
                    continue;
                }
                health.record_in(audio.size());

                let converted = match resampler
                    .convert(&audio.data)
                    .and_then(|pcm| AudioData::pcm(pcm, output))
                {
                    Ok(converted) => converted,
                    Err(e) => {
                        health.record_failure();
                        warn!("AudioResample: dropping buffer: {}", e);
                        continue;
                    }
                };

                let converted = AudioData {
                    captured_at: audio.captured_at,
                    turn: audio.turn,
                    ..converted
                };
                if !emit(&outbound, converted.into(), &cancel).await {
                    break;
                }
                health.record_out();
            }

            info!("AudioResample: finished");
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.core.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_downsamples_frames() {
        let input = PcmFormat::new(48_000, 1).unwrap();
        let output = PcmFormat::new(16_000, 1).unwrap();
        let mut element = AudioResampleElement::new(input, output, 8);
        let mut outlet = element.take_outlet().unwrap();
        element.start(CancellationToken::new()).await.unwrap();

        let inlet = element.inlet();
        let frame = Bytes::from(vec![0u8; input.frame_bytes()]);
        inlet.send(AudioData::pcm(frame.clone(), input).unwrap().into()).await.unwrap();
        // Wrong rate is skipped, not resampled
        inlet
            .send(AudioData::pcm(frame, PcmFormat::new(24_000, 1).unwrap()).unwrap().into())
            .await
            .unwrap();
        inlet.close();

        let out = outlet.recv().await.unwrap().into_audio(MediaType::RawPcm).unwrap();
        assert_eq!(out.sample_rate, 16_000);
        assert_eq!(out.size(), output.frame_bytes());
        assert!(outlet.recv().await.is_none());

        element.stop().await.unwrap();
        let summary = element.health().summary();
        assert_eq!(summary.messages_out, 1);
        assert_eq!(summary.filtered, 1);
    }
}
