//! Absolute-time units and the exported conversions.
//!
//! Absolute time is nanoseconds since an arbitrary fixed epoch (boot), so
//! the absolute-time ↔ nanosecond mappings are the identity and the
//! timebase ratio is 1/1. The seconds-based conversions are plain integer
//! division and remainder.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;
/// Nanoseconds per millisecond.
pub const NSEC_PER_MSEC: u64 = 1_000_000;
/// Nanoseconds per microsecond.
pub const NSEC_PER_USEC: u64 = 1_000;
/// Microseconds per second.
pub const USEC_PER_SEC: u64 = 1_000_000;

/// A point on the kernel's monotonic time line, in nanoseconds since boot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AbsoluteTime(pub u64);

impl AbsoluteTime {
    /// The deadline that never arrives; used when nothing is armed.
    pub const END_OF_ALL_TIME: AbsoluteTime = AbsoluteTime(u64::MAX);

    /// Raw nanosecond value.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Add an interval, saturating at [`AbsoluteTime::END_OF_ALL_TIME`].
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, interval_ns: u64) -> Self {
        Self(self.0.saturating_add(interval_ns))
    }
}

impl fmt::Display for AbsoluteTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = absolutetime_to_nanotime(*self);
        write!(f, "{}.{:09}", t.secs, t.nanos)
    }
}

/// Seconds plus microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecsMicros {
    /// Whole seconds.
    pub secs: u64,
    /// Microseconds within the second.
    pub micros: u32,
    /// Nanoseconds within the second that the microsecond field was cut from.
    pub remainder_ns: u32,
}

/// Seconds plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecsNanos {
    /// Whole seconds.
    pub secs: u64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

/// Ratio between absolute-time units and nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimebaseInfo {
    /// Numerator.
    pub numer: u32,
    /// Denominator.
    pub denom: u32,
}

/// Absolute-time units are nanoseconds.
#[inline]
#[must_use]
pub const fn timebase_info() -> TimebaseInfo {
    TimebaseInfo { numer: 1, denom: 1 }
}

#[inline]
#[must_use]
pub const fn absolutetime_to_nanoseconds(abstime: AbsoluteTime) -> u64 {
    abstime.0
}

#[inline]
#[must_use]
pub const fn nanoseconds_to_absolutetime(nanoseconds: u64) -> AbsoluteTime {
    AbsoluteTime(nanoseconds)
}

/// Split into seconds and microseconds, truncating sub-microsecond digits.
#[inline]
#[must_use]
pub const fn absolutetime_to_microtime(abstime: AbsoluteTime) -> SecsMicros {
    let secs = abstime.0 / NSEC_PER_SEC;
    let remain = (abstime.0 % NSEC_PER_SEC) as u32;
    SecsMicros {
        secs,
        micros: remain / NSEC_PER_USEC as u32,
        remainder_ns: remain,
    }
}

#[inline]
#[must_use]
pub const fn absolutetime_to_nanotime(abstime: AbsoluteTime) -> SecsNanos {
    SecsNanos {
        secs: abstime.0 / NSEC_PER_SEC,
        nanos: (abstime.0 % NSEC_PER_SEC) as u32,
    }
}

/// Wrapping on overflow; callers pass seconds-since-boot values.
#[inline]
#[must_use]
pub const fn nanotime_to_absolutetime(secs: u64, nanos: u32) -> AbsoluteTime {
    AbsoluteTime(secs.wrapping_mul(NSEC_PER_SEC).wrapping_add(nanos as u64))
}

/// Convert `interval` units of `scale_factor` nanoseconds to an absolute-time delta.
#[inline]
#[must_use]
pub const fn clock_interval_to_absolutetime_interval(interval: u32, scale_factor: u32) -> u64 {
    interval as u64 * scale_factor as u64
}
