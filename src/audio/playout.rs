//! Playout buffer with pre-roll after discontinuities
//!
//! Absorbs bursty, irregular-size PCM writes and hands out exactly one
//! 20 ms frame per read, whatever is buffered at that moment.

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::sync::Mutex;

use super::pcm::PcmFormat;
use super::resample::Resampler;
use crate::error::{BridgeError, Result};

/// Playout state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutState {
    /// Frames are handed out as soon as data exists
    Draining,
    /// Silence until the pre-roll threshold has been buffered again
    Accumulating,
}

struct Accumulator {
    data: BytesMut,
    state: PlayoutState,
}

/// Converts writes to the output format and meters them out frame by frame.
///
/// Writers are serialized by the resampler lock; the accumulator and state
/// share a second lock so the periodic reader never waits on a conversion.
/// Lock order is always resampler, then accumulator.
pub struct PlayoutBuffer {
    output: PcmFormat,
    frame_bytes: usize,
    threshold: usize,
    resampler: Mutex<Option<Resampler>>,
    accumulator: Mutex<Accumulator>,
}

impl PlayoutBuffer {
    /// Create a buffer converting `input` writes to `output` frames.
    ///
    /// A fresh buffer starts out draining; pre-roll only applies after
    /// [`clear`](Self::clear).
    pub fn new(input: PcmFormat, output: PcmFormat, pre_roll_frames: usize) -> Result<Self> {
        let resampler = Resampler::new(input, output)?;
        let frame_bytes = output.frame_bytes();
        Ok(Self {
            output,
            frame_bytes,
            threshold: pre_roll_frames * frame_bytes,
            resampler: Mutex::new(Some(resampler)),
            accumulator: Mutex::new(Accumulator {
                data: BytesMut::new(),
                state: PlayoutState::Draining,
            }),
        })
    }

    pub fn output_format(&self) -> PcmFormat {
        self.output
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Resample `pcm` and append it. Empty input is a no-op.
    pub fn write(&self, pcm: &[u8]) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }

        let mut resampler = self
            .resampler
            .lock()
            .map_err(|_| BridgeError::BufferClosed)?;
        let converted = resampler
            .as_mut()
            .ok_or(BridgeError::BufferClosed)?
            .convert(pcm)?;

        let mut acc = self.lock_accumulator();
        acc.data.extend_from_slice(&converted);
        Ok(())
    }

    /// Next frame of exactly [`frame_bytes`](Self::frame_bytes) bytes
    pub fn read_frame(&self) -> Bytes {
        let mut acc = self.lock_accumulator();

        if acc.state == PlayoutState::Accumulating {
            if acc.data.len() < self.threshold {
                return self.silence();
            }
            debug!(
                "Playout: pre-roll reached ({} bytes), resuming",
                acc.data.len()
            );
            acc.state = PlayoutState::Draining;
        }

        let buffered = acc.data.len();
        if buffered >= self.frame_bytes {
            acc.data.split_to(self.frame_bytes).freeze()
        } else if buffered > 0 {
            // Short tail is flushed with padding rather than held back
            let mut frame = acc.data.split();
            frame.resize(self.frame_bytes, 0);
            frame.freeze()
        } else {
            self.silence()
        }
    }

    /// Drop everything buffered and wait for pre-roll again.
    ///
    /// Samples the resampler still holds from before belong to the old
    /// stream too, so it starts over as well.
    pub fn clear(&self) {
        if let Ok(mut resampler) = self.resampler.lock()
            && let Some(resampler) = resampler.as_mut()
            && let Err(e) = resampler.reset()
        {
            warn!("Playout: resampler reset failed: {}", e);
        }

        let mut acc = self.lock_accumulator();
        info!(
            "Playout: cleared {} buffered bytes, accumulating",
            acc.data.len()
        );
        acc.data.clear();
        acc.state = PlayoutState::Accumulating;
    }

    /// Stop waiting for pre-roll; used at end of input so a short tail still plays
    pub fn drain(&self) {
        self.lock_accumulator().state = PlayoutState::Draining;
    }

    /// Bytes currently buffered
    pub fn available(&self) -> usize {
        self.lock_accumulator().data.len()
    }

    pub fn state(&self) -> PlayoutState {
        self.lock_accumulator().state
    }

    /// Release the resampler. Later writes fail with [`BridgeError::BufferClosed`].
    pub fn close(&self) {
        if let Ok(mut resampler) = self.resampler.lock() {
            resampler.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.resampler.lock().map(|r| r.is_none()).unwrap_or(true)
    }

    fn silence(&self) -> Bytes {
        Bytes::from(vec![0u8; self.frame_bytes])
    }

    fn lock_accumulator(&self) -> std::sync::MutexGuard<'_, Accumulator> {
        // A panicking writer cannot leave the byte queue half-updated
        self.accumulator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
