//! Per-CPU time-base record.
//!
//! Nanotime is `ns_base + convert(counter - cycle_base)`, where the
//! conversion mode is encoded by `shift` (see [`delta_to_nanoseconds`]).
//! The four fields are published together through a [`SeqLock`], so every
//! reader sees a mutually consistent set.

use crate::fixed_point::{delta_to_nanoseconds, STANDARD_SHIFT};
use crate::hal::{CycleCounter, IrqDisabled};
use crate::seqlock::SeqLock;

/// Origin and conversion parameters of one CPU's nanotime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeBase {
    /// Counter value at which `ns_base` was true.
    pub cycle_base: u64,
    /// Nanoseconds since epoch at `cycle_base`.
    pub ns_base: u64,
    /// Nanoseconds per cycle, Q32.32.
    pub scale: u32,
    /// 32 for multiply-shift mode, otherwise the slow counter's frequency.
    pub shift: u32,
}

impl TimeBase {
    /// Extrapolate nanotime at counter value `counter`.
    ///
    /// A counter reading behind `cycle_base` (a reset raced with the read)
    /// yields `ns_base` rather than wrapping.
    #[inline]
    #[must_use]
    pub const fn nanotime_at(&self, counter: u64) -> u64 {
        self.ns_base.wrapping_add(delta_to_nanoseconds(
            counter.saturating_sub(self.cycle_base),
            self.scale,
            self.shift,
        ))
    }

    /// Whether the record uses the slow-counter division mode.
    #[inline]
    #[must_use]
    pub const fn is_slow_counter(&self) -> bool {
        self.shift != STANDARD_SHIFT && self.shift != 0
    }
}

/// One CPU's time base, written by its owning CPU and readable everywhere.
#[derive(Debug, Default)]
pub struct TimeBaseRecord {
    base: SeqLock<TimeBase>,
}

impl TimeBaseRecord {
    /// An uncalibrated record: all fields zero, generation 0.
    pub const fn new() -> Self {
        Self {
            base: SeqLock::new(TimeBase {
                cycle_base: 0,
                ns_base: 0,
                scale: 0,
                shift: 0,
            }),
        }
    }

    /// Replace all four fields in one generation step.
    #[inline]
    pub fn store(&self, _irq: &IrqDisabled, base: TimeBase) {
        self.base.store(base);
    }

    /// Current nanotime. Never blocks beyond a writer's masked window.
    #[inline]
    pub fn read<C: CycleCounter + ?Sized>(&self, counter: &C) -> u64 {
        self.base.read_with(|base| base.nanotime_at(counter.read()))
    }

    /// Nanotime at an explicit counter value.
    #[inline]
    pub fn read_at(&self, counter: u64) -> u64 {
        self.base.read().nanotime_at(counter)
    }

    /// Consistent copy of the current fields.
    #[inline]
    pub fn snapshot(&self) -> TimeBase {
        self.base.read()
    }

    /// Seqlock generation; even when stable.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.base.generation()
    }
}
