//! In-process transport over tokio channels, for tests and the loopback demo

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{AudioSink, AudioSource};

pub struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

/// Source fed through the returned sender; ends when every sender is dropped
pub fn memory_source(capacity: usize) -> (mpsc::Sender<Bytes>, MemorySource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, MemorySource { rx })
}

#[async_trait]
impl AudioSource for MemorySource {
    async fn read_unit(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

pub struct MemorySink {
    tx: mpsc::Sender<(Bytes, Duration)>,
}

/// Sink whose writes come out of the returned receiver
pub fn memory_sink(capacity: usize) -> (MemorySink, mpsc::Receiver<(Bytes, Duration)>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MemorySink { tx }, rx)
}

#[async_trait]
impl AudioSink for MemorySink {
    async fn write_unit(&mut self, payload: Bytes, duration: Duration) -> Result<()> {
        self.tx
            .send((payload, duration))
            .await
            .map_err(|_| anyhow::anyhow!("memory sink receiver dropped"))
    }
}
