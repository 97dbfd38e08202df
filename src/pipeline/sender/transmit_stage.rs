//! Transmit stage for the outbound leg
//!
//! Hands encoded Opus packets to the call transport, one frame duration each.

use async_trait::async_trait;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::assets::FRAME_DURATION;
use crate::error::{BridgeError, Result};
use crate::pipeline::element::{Element, ElementCore, Ports, next_message};
use crate::pipeline::types::MediaType;
use crate::transport::AudioSink;

/// Tail of the outbound leg; emits nothing downstream
pub struct TransportSinkElement {
    core: ElementCore,
    sink: Option<Box<dyn AudioSink>>,
}

impl TransportSinkElement {
    pub fn new(sink: Box<dyn AudioSink>, capacity: usize) -> Self {
        Self {
            core: ElementCore::new("TransportSink", capacity),
            sink: Some(sink),
        }
    }
}

#[async_trait]
impl Element for TransportSinkElement {
    crate::delegate_element_core!();

    async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        self.core.ensure_idle()?;
        let mut sink = self
            .sink
            .take()
            .ok_or(BridgeError::ElementClosed(self.core.name()))?;
        let Ports {
            mut inbound,
            cancel,
            ..
        } = self.core.begin(&lifetime)?;

        let health = self.core.health();

        self.core.spawn(async move {
            let mut sent = 0u64;

            while let Some(msg) = next_message(&mut inbound, &cancel).await {
                let Some(audio) = msg.into_audio(MediaType::Opus) else {
                    health.record_filtered();
                    continue;
                };
                health.record_in(audio.size());

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = sink.write_unit(audio.data, FRAME_DURATION) => result,
                };
                match result {
                    Ok(()) => {
                        sent += 1;
                        health.record_out();
                    }
                    Err(e) => {
                        health.record_failure();
                        warn!("TransportSink: {}", e);
                    }
                }
            }

            info!("TransportSink: finished, {} packets sent", sent);
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.core.shutdown().await?;
        Ok(())
    }
}
