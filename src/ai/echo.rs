use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::{AiMessage, AiSession, AudioChunk};
use crate::audio::pcm::PcmFormat;
use crate::audio::resample::Resampler;

/// Backend stand-in that speaks back whatever it hears.
///
/// Uplink audio is resampled to the reply rate and returned as inline
/// audio. With `interrupt_every` set, every n-th chunk is preceded by an
/// interruption, which exercises barge-in handling end to end.
pub struct EchoSession {
    resampler: Mutex<Resampler>,
    output_rate: u32,
    replies: Mutex<Option<mpsc::Sender<AiMessage>>>,
    inbox: tokio::sync::Mutex<mpsc::Receiver<AiMessage>>,
    interrupt_every: Option<u64>,
    chunks: AtomicU64,
}

impl EchoSession {
    pub fn new(input: PcmFormat, output: PcmFormat, capacity: usize) -> crate::error::Result<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Ok(Self {
            resampler: Mutex::new(Resampler::new(input, output)?),
            output_rate: output.sample_rate,
            replies: Mutex::new(Some(tx)),
            inbox: tokio::sync::Mutex::new(rx),
            interrupt_every: None,
            chunks: AtomicU64::new(0),
        })
    }

    pub fn with_interrupt_every(mut self, chunks: u64) -> Self {
        self.interrupt_every = (chunks > 0).then_some(chunks);
        self
    }

    /// End the session; `receive` returns `None` once replies are drained
    pub fn close(&self) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.take();
        }
    }

    fn replies(&self) -> Result<mpsc::Sender<AiMessage>> {
        self.replies
            .lock()
            .map_err(|_| anyhow!("echo session poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("echo session closed"))
    }
}

#[async_trait]
impl AiSession for EchoSession {
    async fn send_audio(&self, chunk: AudioChunk) -> Result<()> {
        let replies = self.replies()?;
        let data = self
            .resampler
            .lock()
            .map_err(|_| anyhow!("echo session poisoned"))?
            .convert(&chunk.data)?;

        let n = self.chunks.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.interrupt_every
            && n % every == 0
        {
            replies.send(AiMessage::Interrupted).await?;
            replies.send(AiMessage::Text(format!("turn {}", n / every))).await?;
        }

        replies
            .send(AiMessage::Audio {
                data,
                sample_rate: self.output_rate,
            })
            .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<AiMessage>> {
        Ok(self.inbox.lock().await.recv().await)
    }

    async fn end_input(&self) -> Result<()> {
        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MIME_AI_PCM;
    use bytes::Bytes;

    fn chunk() -> AudioChunk {
        AudioChunk {
            data: Bytes::from(vec![1u8; 640]),
            mime_type: MIME_AI_PCM,
            sample_rate: 16_000,
        }
    }

    #[tokio::test]
    async fn test_echo_resamples() {
        let session = EchoSession::new(
            PcmFormat::new(16_000, 1).unwrap(),
            PcmFormat::new(24_000, 1).unwrap(),
            8,
        )
        .unwrap();

        session.send_audio(chunk()).await.unwrap();
        match session.receive().await.unwrap() {
            Some(AiMessage::Audio { data, sample_rate }) => {
                assert_eq!(sample_rate, 24_000);
                assert_eq!(data.len(), 960);
            }
            other => panic!("unexpected {:?}", other),
        }

        session.close();
        assert!(session.send_audio(chunk()).await.is_err());
        assert!(session.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_periodic_interruptions() {
        let session = EchoSession::new(
            PcmFormat::new(16_000, 1).unwrap(),
            PcmFormat::new(24_000, 1).unwrap(),
            16,
        )
        .unwrap()
        .with_interrupt_every(2);

        session.send_audio(chunk()).await.unwrap();
        session.send_audio(chunk()).await.unwrap();
        session.close();

        let mut kinds = Vec::new();
        while let Some(msg) = session.receive().await.unwrap() {
            kinds.push(match msg {
                AiMessage::Audio { .. } => "audio",
                AiMessage::Interrupted => "interrupted",
                AiMessage::Text(_) => "text",
                AiMessage::TurnComplete => "complete",
            });
        }
        assert_eq!(kinds, ["audio", "interrupted", "text", "audio"]);
    }
}
