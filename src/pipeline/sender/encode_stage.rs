//! Encode stage for the outbound leg
//!
//! Wraps OpusEncoder: one transport-rate PCM frame in, Opus packets out.

use async_trait::async_trait;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::audio::pcm::PcmFormat;
use crate::config::EncoderConfig;
use crate::dump::{DumpSink, DumpTap};
use crate::encoder::OpusEncoder;
use crate::error::Result;
use crate::pipeline::element::{Element, ElementCore, Ports, emit, next_message};
use crate::pipeline::types::{AudioData, MediaType};

pub struct OpusEncodeElement {
    core: ElementCore,
    format: PcmFormat,
    settings: EncoderConfig,
    dump: Option<Box<dyn DumpSink>>,
}

impl OpusEncodeElement {
    pub fn new(format: PcmFormat, settings: EncoderConfig, capacity: usize) -> Self {
        Self {
            core: ElementCore::new("OpusEncode", capacity),
            format,
            settings,
            dump: None,
        }
    }

    /// Mirror every PCM frame before encoding into `sink`
    pub fn with_dump(mut self, sink: Box<dyn DumpSink>) -> Self {
        self.dump = Some(sink);
        self
    }
}

#[async_trait]
impl Element for OpusEncodeElement {
    crate::delegate_element_core!();

    async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        self.core.ensure_idle()?;
        let mut encoder =
            OpusEncoder::new(self.format, self.settings.bitrate, self.settings.complexity)?;
        let Ports {
            mut inbound,
            outbound,
            cancel,
        } = self.core.begin(&lifetime)?;

        let health = self.core.health();
        let format = self.format;
        let mut tap = DumpTap::new("OpusEncode", self.dump.take());

        self.core.spawn(async move {
            let mut packets = 0u64;

            'frames: while let Some(msg) = next_message(&mut inbound, &cancel).await {
                let Some(audio) = msg.into_audio(MediaType::RawPcm) else {
                    health.record_filtered();
                    continue;
                };
                health.record_in(audio.size());
                tap.write(&audio.data);

                let encoded = match encoder.encode(&audio.data) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        health.record_failure();
                        warn!("OpusEncode: dropping frame: {}", e);
                        continue;
                    }
                };

                for packet in encoded {
                    let out = AudioData::opus(packet, format.sample_rate, format.channels());
                    if !emit(&outbound, out.into(), &cancel).await {
                        break 'frames;
                    }
                    packets += 1;
                    health.record_out();
                }
            }

            info!("OpusEncode: finished, {} packets encoded", packets);
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.core.shutdown().await?;
        Ok(())
    }
}
