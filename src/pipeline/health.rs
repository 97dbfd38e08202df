//! Health counters for pipeline elements

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Health metrics for one element
///
/// All fields use atomic operations so workers can record without locking.
pub struct ElementHealth {
    /// Messages accepted by the input filter
    pub messages_in: AtomicU64,

    /// Messages emitted downstream
    pub messages_out: AtomicU64,

    /// Payload bytes processed
    pub bytes_processed: AtomicU64,

    /// Messages skipped because their type or media type is not handled
    pub filtered: AtomicU64,

    /// Single units lost to decode/encode/resample/transport failures
    pub unit_failures: AtomicU64,

    /// Silence frames produced by the playout clock
    pub silence_frames: AtomicU64,

    /// Frames dropped because the downstream queue was full
    pub backpressure_drops: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last processed message
    pub last_activity: AtomicU64,
}

impl ElementHealth {
    pub fn new() -> Self {
        Self {
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            unit_failures: AtomicU64::new(0),
            silence_frames: AtomicU64::new(0),
            backpressure_drops: AtomicU64::new(0),
            last_activity: AtomicU64::new(now_micros()),
        }
    }

    /// Record an accepted input message
    pub fn record_in(&self, size: usize) {
        self.last_activity.store(now_micros(), Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.unit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_silence(&self) {
        self.silence_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Check if the element has been idle longer than `threshold`
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last = self.last_activity.load(Ordering::Relaxed);
        now_micros().saturating_sub(last) > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            unit_failures: self.unit_failures.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
        }
    }
}

impl Default for ElementHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_processed: u64,
    pub filtered: u64,
    pub unit_failures: u64,
    pub silence_frames: u64,
    pub backpressure_drops: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in, {} out, {} bytes, {} filtered, {} failures, {} silence, {} drops",
            self.messages_in,
            self.messages_out,
            self.bytes_processed,
            self.filtered,
            self.unit_failures,
            self.silence_frames,
            self.backpressure_drops
        )
    }
}
