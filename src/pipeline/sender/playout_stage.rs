//! Playout stage for the outbound leg
//!
//! A writer task feeds AI reply audio into a [`PlayoutBuffer`]; a clock task
//! pulls exactly one transport frame out of it every tick, whether or not
//! anything arrived. Barge-in events from the bus clear the buffer.

use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::assets::EVENT_QUEUE_CAPACITY;
use crate::audio::pcm::{PcmFormat, is_silence};
use crate::audio::playout::PlayoutBuffer;
use crate::error::Result;
use crate::pipeline::bus::{Event, EventBus, EventKind};
use crate::pipeline::clock::FrameClock;
use crate::pipeline::element::{Element, ElementCore, Ports};
use crate::pipeline::health::ElementHealth;
use crate::pipeline::types::{AudioData, MediaType, StreamMessage};

pub struct PlayoutElement {
    core: ElementCore,
    bus: EventBus,
    input: PcmFormat,
    output: PcmFormat,
    pre_roll_frames: usize,
    buffer: Option<Arc<PlayoutBuffer>>,
}

impl PlayoutElement {
    pub fn new(
        bus: EventBus,
        input: PcmFormat,
        output: PcmFormat,
        pre_roll_frames: usize,
        capacity: usize,
    ) -> Self {
        Self {
            core: ElementCore::new("Playout", capacity),
            bus,
            input,
            output,
            pre_roll_frames,
            buffer: None,
        }
    }

    /// The buffer while running
    pub fn buffer(&self) -> Option<Arc<PlayoutBuffer>> {
        self.buffer.clone()
    }
}

#[async_trait]
impl Element for PlayoutElement {
    crate::delegate_element_core!();

    async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        self.core.ensure_idle()?;
        let buffer = Arc::new(PlayoutBuffer::new(
            self.input,
            self.output,
            self.pre_roll_frames,
        )?);
        let barge_in = self
            .bus
            .subscribe_channel(EventKind::BargeIn, EVENT_QUEUE_CAPACITY);
        let Ports {
            inbound,
            outbound,
            cancel,
        } = self.core.begin(&lifetime)?;

        let upstream_done = CancellationToken::new();
        let writer = Writer {
            buffer: buffer.clone(),
            health: self.core.health(),
            turn: 0,
        };
        self.core.spawn(writer.run(
            inbound,
            barge_in,
            cancel.clone(),
            upstream_done.clone(),
        ));

        self.core.spawn(emit_frames(
            buffer.clone(),
            FrameClock::new(),
            outbound,
            self.output,
            self.core.health(),
            cancel,
            upstream_done,
        ));

        self.buffer = Some(buffer);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.core.shutdown().await?;
        // Workers are joined; nothing writes any more
        if let Some(buffer) = self.buffer.take() {
            buffer.close();
        }
        Ok(())
    }
}

struct Writer {
    buffer: Arc<PlayoutBuffer>,
    health: Arc<ElementHealth>,
    /// Newest response turn seen; older audio is stale
    turn: u64,
}

impl Writer {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<StreamMessage>,
        mut barge_in: mpsc::Receiver<Event>,
        cancel: CancellationToken,
        upstream_done: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(event) = barge_in.recv() => self.on_barge_in(&event),
                msg = inbound.recv() => match msg {
                    Some(msg) => self.on_message(msg),
                    None => {
                        // Let whatever is still pre-rolling play out
                        self.buffer.drain();
                        info!("Playout: upstream finished at turn {}", self.turn);
                        break;
                    }
                },
            }
        }
        upstream_done.cancel();
    }

    fn on_barge_in(&mut self, event: &Event) {
        match event.payload.get("turn").and_then(|t| t.as_u64()) {
            // Already handled when the first audio of that turn arrived
            Some(turn) if turn <= self.turn => {}
            Some(turn) => {
                self.turn = turn;
                self.buffer.clear();
            }
            None => self.buffer.clear(),
        }
    }

    fn on_message(&mut self, msg: StreamMessage) {
        let Some(audio) = msg.into_audio(MediaType::RawPcm) else {
            self.health.record_filtered();
            return;
        };
        if audio.turn < self.turn {
            self.health.record_filtered();
            return;
        }
        if audio.turn > self.turn {
            self.turn = audio.turn;
            self.buffer.clear();
        }

        self.health.record_in(audio.size());
        if let Err(e) = self.buffer.write(&audio.data) {
            self.health.record_failure();
            warn!("Playout: dropping {} bytes: {}", audio.size(), e);
        }
    }
}

/// One frame per tick; ends once upstream is finished and the buffer is empty
async fn emit_frames(
    buffer: Arc<PlayoutBuffer>,
    mut clock: FrameClock,
    outbound: mpsc::Sender<StreamMessage>,
    format: PcmFormat,
    health: Arc<ElementHealth>,
    cancel: CancellationToken,
    upstream_done: CancellationToken,
) {
    let mut ticks = 0u64;
    let mut drops = 0u64;

    loop {
        let tick = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            tick = clock.tick() => tick,
        };
        ticks = tick.sequence + 1;

        if upstream_done.is_cancelled() && buffer.available() == 0 {
            break;
        }

        let frame = buffer.read_frame();
        if is_silence(&frame) {
            health.record_silence();
        }
        let audio = match AudioData::pcm(frame, format) {
            Ok(audio) => audio,
            Err(e) => {
                health.record_failure();
                warn!("Playout: {}", e);
                continue;
            }
        };

        match outbound.try_send(audio.into()) {
            Ok(()) => health.record_out(),
            Err(TrySendError::Full(_)) => {
                health.record_drop();
                drops += 1;
                if drops % 50 == 1 {
                    warn!(
                        "Playout: downstream full, dropped frame at {} ({} so far)",
                        tick.pts, drops
                    );
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    info!("Playout: clock stopped after {} ticks", ticks);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::samples_to_bytes;
    use bytes::Bytes;
    use serde_json::json;

    fn formats() -> (PcmFormat, PcmFormat) {
        (
            PcmFormat::new(24_000, 1).unwrap(),
            PcmFormat::new(48_000, 1).unwrap(),
        )
    }

    fn reply_frame(turn: u64) -> StreamMessage {
        let (input, _) = formats();
        let pcm: Vec<i16> = (0..input.frame_samples())
            .map(|i| (((i as f32) * 0.1).sin() * 10_000.0) as i16 | 1)
            .collect();
        AudioData::pcm(Bytes::from(samples_to_bytes(&pcm)), input)
            .unwrap()
            .with_turn(turn)
            .into()
    }

    #[tokio::test]
    async fn test_plays_out_and_finishes() {
        let (input, output) = formats();
        let mut element = PlayoutElement::new(EventBus::new(), input, output, 5, 16);
        let mut outlet = element.take_outlet().unwrap();
        element.start(CancellationToken::new()).await.unwrap();

        let inlet = element.inlet();
        for _ in 0..3 {
            inlet.send(reply_frame(0)).await.unwrap();
        }
        inlet.close();

        let mut voiced = 0;
        while let Some(msg) = outlet.recv().await {
            let audio = msg.into_audio(MediaType::RawPcm).unwrap();
            assert_eq!(audio.sample_rate, 48_000);
            assert_eq!(audio.size(), output.frame_bytes());
            if !is_silence(&audio.data) {
                voiced += 1;
            }
        }
        assert_eq!(voiced, 3);

        let buffer = element.buffer().unwrap();
        element.stop().await.unwrap();
        assert!(buffer.is_closed());
        assert!(element.buffer().is_none());
    }

    #[tokio::test]
    async fn test_turns_and_barge_in() {
        let (input, output) = formats();
        let buffer = Arc::new(PlayoutBuffer::new(input, output, 5).unwrap());
        let mut writer = Writer {
            buffer: buffer.clone(),
            health: Arc::new(ElementHealth::new()),
            turn: 0,
        };
        let frame = output.frame_bytes();

        writer.on_message(reply_frame(0));
        assert_eq!(buffer.available(), frame);

        writer.on_barge_in(&Event::new(EventKind::BargeIn, json!({ "turn": 1 })));
        assert_eq!(buffer.available(), 0);

        // Stale audio from before the interruption
        writer.on_message(reply_frame(0));
        assert_eq!(buffer.available(), 0);

        writer.on_message(reply_frame(1));
        writer.on_barge_in(&Event::new(EventKind::BargeIn, json!({ "turn": 1 })));
        assert_eq!(buffer.available(), frame);

        // New turn arriving ahead of its event clears on its own
        writer.on_message(reply_frame(2));
        assert_eq!(buffer.available(), frame);
        assert_eq!(writer.turn, 2);

        writer.on_barge_in(&Event::new(EventKind::BargeIn, json!({})));
        assert_eq!(buffer.available(), 0);
        assert_eq!(writer.health.summary().filtered, 1);
    }

    #[tokio::test]
    async fn test_stop_without_input() {
        let (input, output) = formats();
        let mut element = PlayoutElement::new(EventBus::new(), input, output, 5, 4);
        let mut outlet = element.take_outlet().unwrap();
        element.start(CancellationToken::new()).await.unwrap();

        let first = outlet.recv().await.unwrap().into_audio(MediaType::RawPcm).unwrap();
        assert!(is_silence(&first.data));

        element.stop().await.unwrap();
        while outlet.recv().await.is_some() {}
        assert!(element.health().summary().silence_frames >= 1);
    }
}
