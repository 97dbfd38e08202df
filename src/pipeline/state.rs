//! Element and pipeline lifecycle

use std::time::Instant;

/// Lifecycle state machine
///
/// Shared by elements and the pipeline. An element runs at most once:
/// after `Stopped` there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    /// Constructed, not started yet
    Idle,

    /// Workers are running
    Running {
        /// When the workers were spawned
        started_at: Instant,
    },

    /// Cancellation requested, waiting for workers
    Stopping,

    /// Workers joined and resources released
    Stopped,
}

impl ElementState {
    /// Whether moving to `target` is allowed; nothing leaves `Stopped`
    pub fn can_transition_to(&self, target: &ElementState) -> bool {
        use ElementState::*;

        // Idle -> Stopped: discarded without ever being started
        matches!(
            (self, target),
            (Idle, Running { .. } | Stopped) | (Running { .. }, Stopping) | (Stopping, Stopped)
        )
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            ElementState::Idle => "Idle",
            ElementState::Running { .. } => "Running",
            ElementState::Stopping => "Stopping",
            ElementState::Stopped => "Stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ElementState::Running { .. })
    }

    /// Check if the element is stopped or stopping
    pub fn is_stopped(&self) -> bool {
        matches!(self, ElementState::Stopped | ElementState::Stopping)
    }

    /// Get the duration since the element started (if running)
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let ElementState::Running { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for ElementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
