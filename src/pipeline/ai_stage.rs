//! Bridge between the pipeline and a streaming AI session
//!
//! Two workers share the session: the uplink forwards 16 kHz PCM as it
//! arrives, the downlink turns whatever the backend says into pipeline
//! messages and bus events. Every interruption starts a new response turn;
//! audio is stamped with its turn so the playout side can discard what was
//! queued before the interruption.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ai::{AiMessage, AiSession, AudioChunk};
use crate::assets::{MAX_CONSECUTIVE_FAILURES, MIME_AI_PCM};
use crate::audio::pcm::PcmFormat;
use crate::error::Result;
use crate::pipeline::bus::{EventBus, EventKind};
use crate::pipeline::element::{Element, ElementCore, Ports, emit, next_message};
use crate::pipeline::health::ElementHealth;
use crate::pipeline::types::{AudioData, MediaType, StreamMessage};

pub struct AiBridgeElement {
    core: ElementCore,
    session: Arc<dyn AiSession>,
    bus: EventBus,
    input: PcmFormat,
    output: PcmFormat,
}

impl AiBridgeElement {
    pub fn new(
        session: Arc<dyn AiSession>,
        bus: EventBus,
        input: PcmFormat,
        output: PcmFormat,
        capacity: usize,
    ) -> Self {
        Self {
            core: ElementCore::new("AiBridge", capacity),
            session,
            bus,
            input,
            output,
        }
    }
}

#[async_trait]
impl Element for AiBridgeElement {
    crate::delegate_element_core!();

    async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        let Ports {
            inbound,
            outbound,
            cancel,
        } = self.core.begin(&lifetime)?;

        self.core.spawn(uplink(
            self.session.clone(),
            inbound,
            self.input,
            self.core.health(),
            cancel.clone(),
        ));

        let downlink = Downlink {
            session: self.session.clone(),
            bus: self.bus.clone(),
            output: self.output,
            health: self.core.health(),
            turn: 0,
        };
        self.core.spawn(downlink.run(outbound, cancel));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.core.shutdown().await?;
        Ok(())
    }
}

async fn uplink(
    session: Arc<dyn AiSession>,
    mut inbound: tokio::sync::mpsc::Receiver<StreamMessage>,
    input: PcmFormat,
    health: Arc<ElementHealth>,
    cancel: CancellationToken,
) {
    let mut sent = 0u64;

    while let Some(msg) = next_message(&mut inbound, &cancel).await {
        let Some(audio) = msg.into_audio(MediaType::RawPcm) else {
            health.record_filtered();
            continue;
        };
        if audio.sample_rate != input.sample_rate || audio.channels != input.channels() {
            health.record_filtered();
            warn!(
                "AiBridge: skipping {} Hz/{} ch uplink buffer, expected {}",
                audio.sample_rate, audio.channels, input
            );
            continue;
        }
        health.record_in(audio.size());

        let chunk = AudioChunk {
            data: audio.data,
            mime_type: MIME_AI_PCM,
            sample_rate: input.sample_rate,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = session.send_audio(chunk) => result,
        };
        match result {
            Ok(()) => sent += 1,
            Err(e) => {
                health.record_failure();
                warn!("AiBridge: failed to send audio: {}", e);
            }
        }
    }

    if !cancel.is_cancelled()
        && let Err(e) = session.end_input().await
    {
        warn!("AiBridge: failed to end input: {}", e);
    }
    info!("AiBridge: uplink finished, {} chunks sent", sent);
}

struct Downlink {
    session: Arc<dyn AiSession>,
    bus: EventBus,
    output: PcmFormat,
    health: Arc<ElementHealth>,
    turn: u64,
}

impl Downlink {
    async fn run(
        mut self,
        outbound: tokio::sync::mpsc::Sender<StreamMessage>,
        cancel: CancellationToken,
    ) {
        let mut failures = 0u32;

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.session.receive() => received,
            };

            let message = match received {
                Ok(Some(message)) => {
                    failures = 0;
                    message
                }
                Ok(None) => {
                    info!("AiBridge: session ended");
                    break;
                }
                Err(e) => {
                    self.health.record_failure();
                    failures += 1;
                    warn!("AiBridge: receive failed: {}", e);
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        warn!("AiBridge: {} failures in a row, giving up", failures);
                        self.bus.publish_kind(
                            EventKind::Error,
                            json!({
                                "element": "AiBridge",
                                "error": e.to_string(),
                                "failures": failures,
                            }),
                        );
                        break;
                    }
                    continue;
                }
            };

            let Some(msg) = self.handle(message) else {
                continue;
            };
            if !emit(&outbound, msg, &cancel).await {
                break;
            }
            self.health.record_out();
        }

        info!("AiBridge: downlink finished at turn {}", self.turn);
    }

    /// Map one backend message; returns what should go downstream
    fn handle(&mut self, message: AiMessage) -> Option<StreamMessage> {
        match message {
            AiMessage::Text(text) => {
                debug!("AiBridge: text: {}", text);
                self.bus.publish_kind(
                    EventKind::PartialResult,
                    json!({ "turn": self.turn, "text": text }),
                );
                Some(StreamMessage::text(text))
            }
            AiMessage::Audio { data, sample_rate } => {
                if sample_rate != self.output.sample_rate {
                    self.health.record_filtered();
                    warn!(
                        "AiBridge: skipping {} Hz reply audio, expected {}",
                        sample_rate, self.output
                    );
                    return None;
                }
                self.health.record_in(data.len());
                match AudioData::pcm(data, self.output) {
                    Ok(audio) => Some(audio.with_turn(self.turn).into()),
                    Err(e) => {
                        self.health.record_failure();
                        warn!("AiBridge: dropping reply audio: {}", e);
                        None
                    }
                }
            }
            AiMessage::Interrupted => {
                self.turn += 1;
                info!("AiBridge: interrupted, starting turn {}", self.turn);
                self.bus
                    .publish_kind(EventKind::BargeIn, json!({ "turn": self.turn }));
                None
            }
            AiMessage::TurnComplete => {
                self.bus
                    .publish_kind(EventKind::FinalResult, json!({ "turn": self.turn }));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::EchoSession;
    use bytes::Bytes;

    fn formats() -> (PcmFormat, PcmFormat) {
        (
            PcmFormat::new(16_000, 1).unwrap(),
            PcmFormat::new(24_000, 1).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_round_trip_through_session() {
        let (input, output) = formats();
        let session = Arc::new(EchoSession::new(input, output, 16).unwrap().with_interrupt_every(2));
        let bus = EventBus::new();
        let mut barge_in = bus.subscribe_channel(EventKind::BargeIn, 4);
        let mut partial = bus.subscribe_channel(EventKind::PartialResult, 4);

        let mut element = AiBridgeElement::new(session, bus, input, output, 8);
        let mut outlet = element.take_outlet().unwrap();
        element.start(CancellationToken::new()).await.unwrap();

        let inlet = element.inlet();
        for _ in 0..2 {
            let frame = Bytes::from(vec![0u8; input.frame_bytes()]);
            inlet.send(AudioData::pcm(frame, input).unwrap().into()).await.unwrap();
        }
        inlet.close();

        let mut turns = Vec::new();
        let mut texts = 0;
        while let Some(msg) = outlet.recv().await {
            match msg {
                StreamMessage::Audio(audio) => {
                    assert_eq!(audio.sample_rate, 24_000);
                    assert_eq!(audio.size(), output.frame_bytes());
                    turns.push(audio.turn);
                }
                StreamMessage::Text(_) => texts += 1,
                StreamMessage::Video(_) => unreachable!(),
            }
        }
        assert_eq!(turns, [0, 1]);
        assert_eq!(texts, 1);

        let event = barge_in.recv().await.unwrap();
        assert_eq!(event.payload["turn"], 1);
        assert_eq!(partial.recv().await.unwrap().payload["text"], "turn 1");

        element.stop().await.unwrap();
    }

    /// Backend whose replies always fail
    struct Unreachable;

    #[async_trait::async_trait]
    impl AiSession for Unreachable {
        async fn send_audio(&self, _chunk: AudioChunk) -> anyhow::Result<()> {
            Ok(())
        }

        async fn receive(&self) -> anyhow::Result<Option<AiMessage>> {
            Err(anyhow::anyhow!("connection reset"))
        }
    }

    #[tokio::test]
    async fn test_gives_up_on_a_dead_backend() {
        let (input, output) = formats();
        let bus = EventBus::new();
        let mut errors = bus.subscribe_channel(EventKind::Error, 4);

        let mut element = AiBridgeElement::new(Arc::new(Unreachable), bus, input, output, 4);
        let mut outlet = element.take_outlet().unwrap();
        element.start(CancellationToken::new()).await.unwrap();
        element.inlet().close();

        // Downlink ends on its own, closing the output
        assert!(outlet.recv().await.is_none());
        let error = errors.recv().await.unwrap();
        assert_eq!(error.payload["element"], "AiBridge");
        assert_eq!(error.payload["failures"], MAX_CONSECUTIVE_FAILURES);
        assert_eq!(
            element.health().summary().unit_failures,
            MAX_CONSECUTIVE_FAILURES as u64
        );

        element.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_session_is_silent() {
        let (input, output) = formats();
        let session = Arc::new(EchoSession::new(input, output, 4).unwrap());
        let mut element = AiBridgeElement::new(session, EventBus::new(), input, output, 4);
        element.start(CancellationToken::new()).await.unwrap();
        element.stop().await.unwrap();
        assert!(element.state().is_stopped());
    }
}
