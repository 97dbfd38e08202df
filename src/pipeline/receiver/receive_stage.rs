//! Source element for the inbound leg
//!
//! Pulls Opus payloads from the call transport and tags them for decoding.

use async_trait::async_trait;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::assets::{MAX_CONSECUTIVE_FAILURES, MAX_OPUS_PACKET};
use crate::error::{BridgeError, Result};
use crate::pipeline::element::{Element, ElementCore, Ports, emit};
use crate::pipeline::types::AudioData;
use crate::transport::AudioSource;

/// Head of the inbound leg: transport payloads become Opus messages.
///
/// The element has no upstream; its inlet exists but is never read. The
/// outlet ends when the transport reports the end of the track.
pub struct TransportSourceElement {
    core: ElementCore,
    source: Option<Box<dyn AudioSource>>,
    sample_rate: u32,
    channels: u16,
}

impl TransportSourceElement {
    pub fn new(
        source: Box<dyn AudioSource>,
        sample_rate: u32,
        channels: u16,
        capacity: usize,
    ) -> Self {
        Self {
            core: ElementCore::new("TransportSource", capacity),
            source: Some(source),
            sample_rate,
            channels,
        }
    }
}

#[async_trait]
impl Element for TransportSourceElement {
    crate::delegate_element_core!();

    async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        self.core.ensure_idle()?;
        let mut source = self
            .source
            .take()
            .ok_or(BridgeError::ElementClosed(self.core.name()))?;
        let Ports {
            outbound, cancel, ..
        } = self.core.begin(&lifetime)?;

        let health = self.core.health();
        let (sample_rate, channels) = (self.sample_rate, self.channels);

        self.core.spawn(async move {
            let mut packets = 0u64;
            let mut failures = 0u32;

            loop {
                let unit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    unit = source.read_unit() => unit,
                };

                let payload = match unit {
                    Ok(Some(payload)) => {
                        failures = 0;
                        payload
                    }
                    Ok(None) => {
                        info!("TransportSource: track ended");
                        break;
                    }
                    Err(e) => {
                        health.record_failure();
                        failures += 1;
                        warn!("TransportSource: read failed: {}", e);
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            warn!("TransportSource: {} failures in a row, giving up", failures);
                            break;
                        }
                        continue;
                    }
                };

                if payload.is_empty() || payload.len() > MAX_OPUS_PACKET {
                    health.record_filtered();
                    continue;
                }

                health.record_in(payload.len());
                packets += 1;
                let audio = AudioData::opus(payload, sample_rate, channels);
                if !emit(&outbound, audio.into(), &cancel).await {
                    break;
                }
                health.record_out();
            }

            info!("TransportSource: finished, {} packets received", packets);
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.core.shutdown().await?;
        Ok(())
    }
}
