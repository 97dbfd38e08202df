//! Debug dumps of raw audio
//!
//! Elements can mirror every buffer they process into a [`DumpSink`].
//! Persisting the bytes (e.g. into a WAV container) is up to the sink;
//! whatever it does, a failing sink never disturbs the audio path.

use anyhow::{Result, bail};
use log::warn;
use std::sync::{Arc, Mutex};

pub trait DumpSink: Send + Sync {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Element-side wrapper: forwards writes and swallows sink failures
pub struct DumpTap {
    name: &'static str,
    sink: Option<Box<dyn DumpSink>>,
    failures: u64,
}

impl DumpTap {
    pub fn new(name: &'static str, sink: Option<Box<dyn DumpSink>>) -> Self {
        Self {
            name,
            sink,
            failures: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn write(&mut self, data: &[u8]) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.write(data) {
            self.failures += 1;
            // Log the first failure and then every hundredth
            if self.failures % 100 == 1 {
                warn!("{}: failed to dump audio ({} failures): {}", self.name, self.failures, e);
            }
        }
    }
}

impl Drop for DumpTap {
    fn drop(&mut self) {
        if let Some(mut sink) = self.sink.take()
            && let Err(e) = sink.close()
        {
            warn!("{}: failed to close dump: {}", self.name, e);
        }
    }
}

/// Collects dumped bytes in memory
#[derive(Clone, Default)]
pub struct MemoryDump {
    data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemoryDump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or(true)
    }
}

impl DumpSink for MemoryDump {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            bail!("dump is closed");
        }
        match self.data.lock() {
            Ok(mut buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Err(_) => bail!("dump buffer poisoned"),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.closed.lock() {
            Ok(mut closed) => {
                *closed = true;
                Ok(())
            }
            Err(_) => bail!("dump state poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl DumpSink for Broken {
        fn write(&mut self, _data: &[u8]) -> Result<()> {
            bail!("disk full")
        }
    }

    #[test]
    fn test_tap_forwards_and_closes() {
        let dump = MemoryDump::new();
        {
            let mut tap = DumpTap::new("Test", Some(Box::new(dump.clone())));
            assert!(tap.is_enabled());
            tap.write(&[1, 2]);
            tap.write(&[3]);
        }
        assert_eq!(dump.bytes(), [1, 2, 3]);
        assert!(dump.is_closed());

        let mut closed = dump.clone();
        assert!(closed.write(&[4]).is_err());
    }

    #[test]
    fn test_failures_are_swallowed() {
        let mut tap = DumpTap::new("Test", Some(Box::new(Broken)));
        for _ in 0..3 {
            tap.write(&[0; 4]);
        }
        assert_eq!(tap.failures, 3);

        let mut disabled = DumpTap::new("Test", None);
        disabled.write(&[0; 4]);
        assert!(!disabled.is_enabled());
    }
}
