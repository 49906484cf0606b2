//! Per-CPU clock lifecycle.
//!
//! State transitions:
//! UNCALIBRATED → CALIBRATED → TICKING
//! UNCALIBRATED → FAILED (terminal; calibration failure halts that CPU)
//!
//! Rebasing never changes the lifecycle state: a ticking CPU stays ticking
//! across idle exits and sleep/wake.

use crate::error::{ClockError, ClockResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Lifecycle states of one CPU's time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ClockState {
    /// Power-on state; the record holds no usable scale.
    #[default]
    Uncalibrated = 0,
    /// Scale/shift and timer constants are set; the record is readable.
    Calibrated = 1,
    /// The one-shot timer is being driven by the deadline scheduler.
    Ticking = 2,
    /// Calibration failed; this CPU never keeps time.
    Failed = 3,
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncalibrated => write!(f, "UNCALIBRATED"),
            Self::Calibrated => write!(f, "CALIBRATED"),
            Self::Ticking => write!(f, "TICKING"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl ClockState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ClockState) -> bool {
        use ClockState::{Calibrated, Failed, Ticking, Uncalibrated};

        matches!(
            (self, target),
            (Uncalibrated, Calibrated) | (Calibrated, Ticking) | (Uncalibrated, Failed)
        )
    }

    /// Returns true once the time base can be read meaningfully.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        matches!(self, Self::Calibrated | Self::Ticking)
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Calibrated,
            2 => Self::Ticking,
            3 => Self::Failed,
            _ => Self::Uncalibrated,
        }
    }
}

/// Lock-free lifecycle cell with transition counting.
///
/// Readers on any CPU may observe the state; transitions are made by the
/// owning CPU only.
#[derive(Debug, Default)]
pub struct ClockStateCell {
    current: AtomicU8,
    transition_count: AtomicU64,
}

impl ClockStateCell {
    /// Create a cell starting in UNCALIBRATED.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(ClockState::Uncalibrated as u8),
            transition_count: AtomicU64::new(0),
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ClockState {
        ClockState::from_raw(self.current.load(Ordering::Acquire))
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count.load(Ordering::Relaxed)
    }

    /// Attempt a state transition.
    pub fn transition(&self, target: ClockState) -> ClockResult<ClockState> {
        let mut current = self.state();
        loop {
            if !current.can_transition_to(target) {
                return Err(ClockError::InvalidStateTransition {
                    from: current.to_string(),
                    to: target.to_string(),
                });
            }
            match self.current.compare_exchange(
                current as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.transition_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(current);
                }
                Err(raw) => current = ClockState::from_raw(raw),
            }
        }
    }
}
