//! Boot-time calibration.
//!
//! Turns the measured counter frequency into the time base's scale/shift
//! and the one-shot timer's frequency into Q32.32 conversion factors and
//! the representable interval range. Calibration runs once per CPU; any
//! failure is fatal for that CPU.

use crate::fixed_point::{timer_convert, STANDARD_SHIFT};
use rtclock_common::config::ClockConfig;
use rtclock_common::error::CalibrationError;
use rtclock_common::time::{NSEC_PER_SEC, NSEC_PER_USEC};
use serde::Serialize;

/// Slowest counter accepted as a time source.
pub const MIN_COUNTER_HZ: u64 = 1_000;

/// Counters below this frequency use the division read path.
///
/// At and above 1 GHz a cycle is at most one nanosecond, so the Q32.32
/// scale fits in 32 bits.
pub const SLOW_COUNTER_THRESHOLD_HZ: u64 = NSEC_PER_SEC;

/// Granularity of the exported CPU speed.
pub const SPEED_ROUNDING_HZ: u64 = 10_000_000;

/// Default largest one-shot count (31-bit register).
pub const DEFAULT_MAX_COUNT: u32 = 0x7fff_ffff;

/// Default floor for armed intervals.
pub const DEFAULT_MIN_INTERVAL_NS: u64 = NSEC_PER_USEC;

/// Conversion parameters stored in the time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleShift {
    /// Nanoseconds per cycle, Q32.32, saturated at `u32::MAX`.
    pub scale: u32,
    /// [`STANDARD_SHIFT`], or the counter frequency in slow-counter mode.
    pub shift: u32,
}

/// Compute `scale = (1e9 << 32) / hz` and select the read mode.
///
/// # Errors
///
/// Zero or sub-[`MIN_COUNTER_HZ`] frequencies cannot keep time.
#[allow(clippy::cast_possible_truncation)]
pub fn compute_scale_shift(cycles_per_second: u64) -> Result<ScaleShift, CalibrationError> {
    if cycles_per_second == 0 {
        return Err(CalibrationError::ZeroFrequency);
    }
    if cycles_per_second < MIN_COUNTER_HZ {
        return Err(CalibrationError::FrequencyTooLow {
            hz: cycles_per_second,
            min_hz: MIN_COUNTER_HZ,
        });
    }

    let scale = u32::try_from((u128::from(NSEC_PER_SEC) << 32) / u128::from(cycles_per_second))
        .unwrap_or(u32::MAX);
    let shift = if cycles_per_second < SLOW_COUNTER_THRESHOLD_HZ {
        // Below 1 GHz the frequency fits in 32 bits
        cycles_per_second as u32
    } else {
        STANDARD_SHIFT
    };

    Ok(ScaleShift { scale, shift })
}

/// Nanosecond ↔ one-shot timer tick conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerConversion {
    /// Timer tick frequency.
    pub frequency_hz: u64,
    /// Ticks per nanosecond, Q32.32.
    pub ns_to_ticks: u64,
    /// Nanoseconds per tick, Q32.32.
    pub ticks_to_ns: u64,
    /// Largest programmable count.
    pub max_count: u32,
    /// Longest interval the count register can encode.
    pub max_interval_ns: u64,
    /// Shortest interval ever armed.
    pub min_interval_ns: u64,
}

impl TimerConversion {
    /// Derive conversion factors for a timer ticking at `frequency_hz`.
    ///
    /// The minimum interval is capped at the maximum so the clamp range is
    /// never empty.
    ///
    /// # Errors
    ///
    /// A zero frequency or zero `max_count` leaves nothing to program.
    pub fn new(
        frequency_hz: u64,
        max_count: u32,
        min_interval_ns: u64,
    ) -> Result<Self, CalibrationError> {
        if frequency_hz == 0 {
            return Err(CalibrationError::ZeroTimerFrequency);
        }
        if max_count == 0 {
            return Err(CalibrationError::ZeroTimerRange);
        }

        let hz = u128::from(frequency_hz);
        let ns = u128::from(NSEC_PER_SEC);
        let ns_to_ticks = u64::try_from((hz << 32) / ns).unwrap_or(u64::MAX);
        let ticks_to_ns = u64::try_from((ns << 32) / hz).unwrap_or(u64::MAX);
        let max_interval_ns = timer_convert(u64::from(max_count), ticks_to_ns);

        Ok(Self {
            frequency_hz,
            ns_to_ticks,
            ticks_to_ns,
            max_count,
            max_interval_ns,
            min_interval_ns: min_interval_ns.min(max_interval_ns),
        })
    }

    /// Count to program for an interval, clamped into `[1, max_count]`.
    #[inline]
    #[must_use]
    pub fn interval_to_count(&self, interval_ns: u64) -> u32 {
        let ticks = timer_convert(interval_ns, self.ns_to_ticks);
        u32::try_from(ticks)
            .unwrap_or(u32::MAX)
            .clamp(1, self.max_count)
    }

    /// Nanoseconds covered by `count` ticks.
    #[inline]
    #[must_use]
    pub fn count_to_interval(&self, count: u32) -> u64 {
        timer_convert(u64::from(count), self.ticks_to_ns)
    }

    /// Clamp an interval into `[min_interval_ns, max_interval_ns]`.
    #[inline]
    #[must_use]
    pub fn clamp_interval(&self, interval_ns: u64) -> u64 {
        interval_ns.clamp(self.min_interval_ns, self.max_interval_ns)
    }
}

/// CPU speed as exported to the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuSpeed {
    /// Measured frequency rounded to the nearest 10 MHz.
    pub frequency_hz: u64,
    /// The same value squeezed into 32 bits, saturating.
    pub clock_rate_hz: u32,
}

/// Round the measured frequency for export.
#[must_use]
pub fn export_speed(cycles_per_second: u64) -> CpuSpeed {
    let rounded = cycles_per_second.saturating_add(SPEED_ROUNDING_HZ / 2) / SPEED_ROUNDING_HZ
        * SPEED_ROUNDING_HZ;
    CpuSpeed {
        frequency_hz: rounded,
        clock_rate_hz: u32::try_from(rounded).unwrap_or(u32::MAX),
    }
}

/// Write-once, per-CPU calibration results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationConstants {
    /// Measured counter frequency.
    pub counter_hz: u64,
    /// Time base conversion parameters.
    pub scale_shift: ScaleShift,
    /// One-shot timer conversion.
    pub timer: TimerConversion,
    /// Exported speed.
    pub speed: CpuSpeed,
}

impl CalibrationConstants {
    /// Longest nanosecond span the timer can encode.
    #[inline]
    #[must_use]
    pub fn max_decrementer_interval(&self) -> u64 {
        self.timer.max_interval_ns
    }

    /// Floor applied to every armed interval.
    #[inline]
    #[must_use]
    pub fn min_decrementer_interval(&self) -> u64 {
        self.timer.min_interval_ns
    }
}

/// Platform-reported frequencies for one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibrator {
    /// Cycle counter frequency.
    pub counter_hz: u64,
    /// One-shot timer tick frequency.
    pub timer_hz: u64,
    /// Largest one-shot count.
    pub max_count: u32,
    /// Requested floor for armed intervals.
    pub min_interval_ns: u64,
}

impl Calibrator {
    /// Calibrator with the default timer range and floor.
    #[must_use]
    pub fn new(counter_hz: u64, timer_hz: u64) -> Self {
        Self {
            counter_hz,
            timer_hz,
            max_count: DEFAULT_MAX_COUNT,
            min_interval_ns: DEFAULT_MIN_INTERVAL_NS,
        }
    }

    /// Calibrator from the `[counter]` and `[timer]` sections.
    #[must_use]
    pub fn from_config(config: &ClockConfig) -> Self {
        Self {
            counter_hz: config.counter.frequency_hz,
            timer_hz: config.timer.frequency_hz,
            max_count: config.timer.max_count,
            min_interval_ns: u64::try_from(config.timer.min_interval.as_nanos())
                .unwrap_or(u64::MAX),
        }
    }

    /// Derive every constant.
    ///
    /// # Errors
    ///
    /// Any [`CalibrationError`] is fatal for the CPU being calibrated.
    pub fn compute(&self) -> Result<CalibrationConstants, CalibrationError> {
        let scale_shift = compute_scale_shift(self.counter_hz)?;
        let timer = TimerConversion::new(self.timer_hz, self.max_count, self.min_interval_ns)?;
        Ok(CalibrationConstants {
            counter_hz: self.counter_hz,
            scale_shift,
            timer,
            speed: export_speed(self.counter_hz),
        })
    }
}
