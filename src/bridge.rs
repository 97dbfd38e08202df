//! One bridged call: transport on one side, AI session on the other

use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ai::AiSession;
use crate::config::BridgeConfig;
use crate::dump::DumpSink;
use crate::error::Result;
use crate::pipeline::{
    AiBridgeElement, AudioResampleElement, EventBus, HealthSummary, OpusDecodeElement,
    OpusEncodeElement, Pipeline, PlayoutElement, TransportSinkElement, TransportSourceElement,
};
use crate::transport::{AudioSink, AudioSource};

/// Optional raw audio taps on either leg
#[derive(Default)]
pub struct CallDumps {
    /// Decoded caller audio at the transport rate
    pub inbound: Option<Box<dyn DumpSink>>,
    /// Transport-rate frames right before encoding
    pub outbound: Option<Box<dyn DumpSink>>,
}

/// Seven elements in one chain:
///
/// ```text
/// TransportSource → OpusDecode → AudioResample → AiBridge
///     → Playout → OpusEncode → TransportSink
/// ```
pub struct CallBridge {
    pipeline: Pipeline,
    bus: EventBus,
}

impl CallBridge {
    pub fn new(
        config: &BridgeConfig,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
        session: Arc<dyn AiSession>,
        bus: EventBus,
        dumps: CallDumps,
    ) -> Result<Self> {
        config.validate()?;
        let transport = config.transport_format()?;
        let ai_input = config.ai_input_format()?;
        let ai_output = config.ai_output_format()?;
        let capacity = config.queue_capacity;

        let mut decode = OpusDecodeElement::new(transport, capacity);
        if let Some(dump) = dumps.inbound {
            decode = decode.with_dump(dump);
        }
        let mut encode = OpusEncodeElement::new(transport, config.encoder.clone(), capacity);
        if let Some(dump) = dumps.outbound {
            encode = encode.with_dump(dump);
        }

        let mut pipeline = Pipeline::new().with_bus(bus.clone());
        let chain = [
            pipeline.add(Box::new(TransportSourceElement::new(
                source,
                transport.sample_rate,
                transport.channels(),
                capacity,
            ))),
            pipeline.add(Box::new(decode)),
            pipeline.add(Box::new(AudioResampleElement::new(
                transport, ai_input, capacity,
            ))),
            pipeline.add(Box::new(AiBridgeElement::new(
                session,
                bus.clone(),
                ai_input,
                ai_output,
                capacity,
            ))),
            pipeline.add(Box::new(PlayoutElement::new(
                bus.clone(),
                ai_output,
                transport,
                config.pre_roll_frames,
                capacity,
            ))),
            pipeline.add(Box::new(encode)),
            pipeline.add(Box::new(TransportSinkElement::new(sink, capacity))),
        ];
        for pair in chain.windows(2) {
            pipeline.link(pair[0], pair[1])?;
        }

        info!(
            "CallBridge: transport {}, AI {} up / {} down",
            transport, ai_input, ai_output
        );
        Ok(Self { pipeline, bus })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        self.bus.start(&lifetime);
        if let Err(e) = self.pipeline.start(lifetime).await {
            self.bus.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop every element and the bus. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<()> {
        let result = self.pipeline.stop().await;
        self.bus.stop().await;
        if let Err(e) = &result {
            warn!("CallBridge: stopped with error: {}", e);
        }
        result
    }

    pub fn health_report(&self) -> Vec<(&'static str, HealthSummary)> {
        self.pipeline.health_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::EchoSession;
    use crate::audio::pcm::{PcmFormat, is_silence, samples_to_bytes};
    use crate::dump::MemoryDump;
    use crate::encoder::OpusEncoder;
    use crate::pipeline::EventKind;
    use crate::transport::{memory_sink, memory_source};
    use std::time::Duration;

    fn tone(format: PcmFormat, frame: usize) -> Vec<u8> {
        let samples = format.frame_samples();
        let pcm: Vec<i16> = (0..samples)
            .map(|i| {
                let t = (frame * samples + i) as f32 / format.sample_rate as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16
            })
            .collect();
        samples_to_bytes(&pcm)
    }

    #[tokio::test]
    async fn test_loopback_call() {
        let config = BridgeConfig::default();
        let transport = config.transport_format().unwrap();
        let session = Arc::new(
            EchoSession::new(
                config.ai_input_format().unwrap(),
                config.ai_output_format().unwrap(),
                64,
            )
            .unwrap()
            .with_interrupt_every(4),
        );

        let (feed, source) = memory_source(64);
        let (sink, mut written) = memory_sink(64);
        let bus = EventBus::new();
        let mut barge_in = bus.subscribe_channel(EventKind::BargeIn, 16);
        let inbound = MemoryDump::new();
        let dumps = CallDumps {
            inbound: Some(Box::new(inbound.clone())),
            outbound: None,
        };

        let mut bridge = CallBridge::new(
            &config,
            Box::new(source),
            Box::new(sink),
            session,
            bus,
            dumps,
        )
        .unwrap();
        let lifetime = CancellationToken::new();
        bridge.start(lifetime.clone()).await.unwrap();

        let mut encoder = OpusEncoder::new(transport, 64_000, 10).unwrap();
        for n in 0..10 {
            for packet in encoder.encode(&tone(transport, n)).unwrap() {
                feed.send(packet).await.unwrap();
            }
        }
        drop(feed);

        let mut packets = 0;
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some((payload, duration)) = written.recv().await {
                assert!(!payload.is_empty());
                assert_eq!(duration, Duration::from_millis(20));
                packets += 1;
            }
        })
        .await;
        assert!(drained.is_ok(), "call did not wind down");
        assert!(packets > 0);
        // All ten caller frames were decoded, interruptions only affect replies
        let heard = inbound.bytes().len();
        assert!(heard >= 9 * transport.frame_bytes());
        assert!(heard <= 10 * transport.frame_bytes());

        bridge.stop().await.unwrap();
        bridge.stop().await.unwrap();

        let report = bridge.health_report();
        assert_eq!(report.len(), 7);
        assert_eq!(report[0].0, "TransportSource");
        assert!(report[0].1.messages_out > 0);
        assert!(barge_in.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_loopback_keeps_every_frame() {
        const FRAMES: usize = 25;
        let config = BridgeConfig::default();
        let transport = config.transport_format().unwrap();
        let session = Arc::new(
            EchoSession::new(
                config.ai_input_format().unwrap(),
                config.ai_output_format().unwrap(),
                64,
            )
            .unwrap(),
        );

        let (feed, source) = memory_source(64);
        let (sink, mut written) = memory_sink(64);
        let inbound = MemoryDump::new();
        let outbound = MemoryDump::new();
        let dumps = CallDumps {
            inbound: Some(Box::new(inbound.clone())),
            outbound: Some(Box::new(outbound.clone())),
        };

        let mut bridge = CallBridge::new(
            &config,
            Box::new(source),
            Box::new(sink),
            session,
            EventBus::new(),
            dumps,
        )
        .unwrap();
        bridge.start(CancellationToken::new()).await.unwrap();

        let mut encoder = OpusEncoder::new(transport, 64_000, 10).unwrap();
        let mut sent = 0;
        for n in 0..FRAMES {
            for packet in encoder.encode(&tone(transport, n)).unwrap() {
                feed.send(packet).await.unwrap();
                sent += 1;
            }
        }
        drop(feed);

        let mut packets = 0;
        tokio::time::timeout(Duration::from_secs(10), async {
            while written.recv().await.is_some() {
                packets += 1;
            }
        })
        .await
        .unwrap();
        bridge.stop().await.unwrap();

        let frame = transport.frame_bytes();
        let heard = inbound.bytes().len();
        assert!(
            heard >= (sent - 1) * frame && heard <= sent * frame,
            "{} bytes decoded from {} packets",
            heard,
            sent
        );

        // Every frame that went in comes back out, plus silence while waiting
        let played = outbound.bytes();
        assert_eq!(played.len() % frame, 0);
        let frames = played.len() / frame;
        assert!(frames >= packets && frames <= packets + 1);
        let voiced = played.chunks(frame).filter(|f| !is_silence(f)).count();
        assert!(
            voiced.abs_diff(sent) <= 1,
            "{} voiced frames for {} sent",
            voiced,
            sent
        );
        assert!(packets + 1 >= voiced);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = BridgeConfig {
            queue_capacity: 0,
            ..BridgeConfig::default()
        };
        let (_feed, source) = memory_source(1);
        let (sink, _written) = memory_sink(1);
        let session = Arc::new(
            EchoSession::new(
                PcmFormat::new(16_000, 1).unwrap(),
                PcmFormat::new(24_000, 1).unwrap(),
                1,
            )
            .unwrap(),
        );
        assert!(
            CallBridge::new(
                &config,
                Box::new(source),
                Box::new(sink),
                session,
                EventBus::new(),
                CallDumps::default(),
            )
            .is_err()
        );
    }
}
