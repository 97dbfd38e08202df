//! Decode stage for the inbound leg
//!
//! Wraps OpusDecoder, producing packed PCM at the transport rate.

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::audio::pcm::PcmFormat;
use crate::decoder::OpusDecoder;
use crate::dump::{DumpSink, DumpTap};
use crate::error::Result;
use crate::pipeline::element::{Element, ElementCore, Ports, emit, next_message};
use crate::pipeline::types::{AudioData, MediaType};

/// Decode stage: one Opus packet in, one PCM buffer out
pub struct OpusDecodeElement {
    core: ElementCore,
    output: PcmFormat,
    dump: Option<Box<dyn DumpSink>>,
}

impl OpusDecodeElement {
    pub fn new(output: PcmFormat, capacity: usize) -> Self {
        Self {
            core: ElementCore::new("OpusDecode", capacity),
            output,
            dump: None,
        }
    }

    /// Mirror every decoded buffer into `sink`
    pub fn with_dump(mut self, sink: Box<dyn DumpSink>) -> Self {
        self.dump = Some(sink);
        self
    }
}

#[async_trait]
impl Element for OpusDecodeElement {
    crate::delegate_element_core!();

    async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        self.core.ensure_idle()?;
        let mut decoder = OpusDecoder::new(self.output)?;
        let Ports {
            mut inbound,
            outbound,
            cancel,
        } = self.core.begin(&lifetime)?;

        let health = self.core.health();
        let output = self.output;
        let mut tap = DumpTap::new("OpusDecode", self.dump.take());

        self.core.spawn(async move {
            let mut decoded = 0u64;

            while let Some(msg) = next_message(&mut inbound, &cancel).await {
                let Some(audio) = msg.into_audio(MediaType::Opus) else {
                    health.record_filtered();
                    continue;
                };
                health.record_in(audio.size());

                let pcm = match decoder.decode(&audio.data) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        health.record_failure();
                        warn!("OpusDecode: dropping packet: {}", e);
                        continue;
                    }
                };
                if pcm.is_empty() {
                    // Decoder is still buffering
                    debug!("OpusDecode: no output for {} byte packet", audio.size());
                    continue;
                }
                tap.write(&pcm);

                let mut out = match AudioData::pcm(pcm, output) {
                    Ok(out) => out,
                    Err(e) => {
                        health.record_failure();
                        warn!("OpusDecode: {}", e);
                        continue;
                    }
                };
                out.captured_at = audio.captured_at;

                if !emit(&outbound, out.into(), &cancel).await {
                    break;
                }
                decoded += 1;
                health.record_out();
            }

            info!("OpusDecode: finished, {} packets decoded", decoded);
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.core.shutdown().await?;
        Ok(())
    }
}
