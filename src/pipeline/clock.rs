//! Fixed-cadence frame clock for the outbound leg

use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::types::Timestamp;
use crate::assets::FRAME_DURATION;

/// One clock tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Ticks delivered so far, starting at 0
    pub sequence: u64,
    /// Time since the clock started
    pub pts: Timestamp,
}

/// Ticks every frame period, independent of data arrival.
///
/// Late ticks are skipped rather than bunched up, so a stalled runtime
/// does not produce a burst of frames afterwards.
pub struct FrameClock {
    interval: Interval,
    base: Instant,
    period: Duration,
    sequence: u64,
}

impl FrameClock {
    /// Clock with the standard 20 ms period
    pub fn new() -> Self {
        Self::with_period(FRAME_DURATION)
    }

    pub fn with_period(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            base: Instant::now(),
            period,
            sequence: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick. The first tick completes immediately.
    pub async fn tick(&mut self) -> Tick {
        let at = self.interval.tick().await;
        let tick = Tick {
            sequence: self.sequence,
            pts: Timestamp::from_duration(at.saturating_duration_since(self.base)),
        };
        self.sequence += 1;
        tick
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}
