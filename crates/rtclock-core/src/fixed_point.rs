//! Fixed-point conversion between counter domains and nanoseconds.
//!
//! Every path multiplies into a 128-bit intermediate, so no input can
//! overflow; results are truncated to the low 64 bits.

use rtclock_common::time::NSEC_PER_SEC;

/// `shift` value selecting the standard multiply-shift mode.
pub const STANDARD_SHIFT: u32 = 32;

/// `(delta_cycles * scale) >> 32` where `scale` is nanoseconds per cycle in Q32.32.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn cycles_to_nanoseconds(delta_cycles: u64, scale: u32) -> u64 {
    ((delta_cycles as u128 * scale as u128) >> 32) as u64
}

/// Convert a counter delta according to the record's encoded mode.
///
/// `shift == 32` (or 0, an uninitialized record) is the multiply-shift
/// mode. Any other value is the counter frequency in Hz of a slow counter,
/// and the delta is divided down directly so no precision is lost to a
/// saturated scale.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn delta_to_nanoseconds(delta_cycles: u64, scale: u32, shift: u32) -> u64 {
    if shift == STANDARD_SHIFT || shift == 0 {
        cycles_to_nanoseconds(delta_cycles, scale)
    } else {
        (delta_cycles as u128 * NSEC_PER_SEC as u128 / shift as u128) as u64
    }
}

/// Q32.32 conversion used for the one-shot timer: `(value * factor) >> 32`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn timer_convert(value: u64, factor: u64) -> u64 {
    ((value as u128 * factor as u128) >> 32) as u64
}
