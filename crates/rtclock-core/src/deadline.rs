//! Deadline to one-shot count translation and timer interrupt entry.
//!
//! `arm` never programs the past and never asks for more than the count
//! register can hold: the interval until the deadline is clamped into
//! `[min_decrementer_interval, max_decrementer_interval]` before being
//! converted to timer ticks.

use crate::calibrate::TimerConversion;
use crate::hal::{InterruptFrame, IrqDisabled, OneShotTimer};
use rtclock_common::cpu::CpuId;
use rtclock_common::time::AbsoluteTime;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// One serviced timer interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerPop {
    /// CPU that took the interrupt.
    pub cpu: CpuId,
    /// Nanotime when the handler ran.
    pub now: AbsoluteTime,
    /// Deadline most recently armed.
    pub deadline: AbsoluteTime,
    /// Service latency; 1 when the pop arrived early or nothing was armed.
    pub latency_ns: u64,
    /// Latency in the trace convention: the negation, so never positive.
    pub reported_latency: i64,
    /// The interrupted context was in user mode.
    pub user_mode: bool,
    /// Interrupted instruction pointer.
    pub instruction_pointer: u64,
}

impl TimerPop {
    /// The pop fired before its deadline.
    #[must_use]
    pub fn is_early(&self) -> bool {
        self.now < self.deadline
    }
}

/// Nanoseconds to arm for `deadline` seen at `now`.
#[inline]
#[must_use]
pub fn deadline_to_interval(deadline: u64, now: u64, timer: &TimerConversion) -> u64 {
    if deadline <= now {
        timer.min_interval_ns
    } else {
        timer.clamp_interval(deadline - now)
    }
}

/// Per-CPU pending deadline and arm/pop bookkeeping.
#[derive(Debug)]
pub struct DeadlineScheduler {
    /// Last armed deadline; `u64::MAX` when nothing is armed.
    pending: AtomicU64,
    /// Count written by the most recent `arm`.
    last_count: AtomicU64,
    /// Number of `arm` calls.
    arms: AtomicU64,
    /// Number of serviced pops.
    pops: AtomicU64,
}

impl Default for DeadlineScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlineScheduler {
    /// Nothing armed.
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(AbsoluteTime::END_OF_ALL_TIME.0),
            last_count: AtomicU64::new(0),
            arms: AtomicU64::new(0),
            pops: AtomicU64::new(0),
        }
    }

    /// The deadline the next pop is measured against.
    pub fn pending_deadline(&self) -> AbsoluteTime {
        AbsoluteTime(self.pending.load(Ordering::Acquire))
    }

    /// Count written by the most recent `arm`, if any.
    pub fn last_count(&self) -> Option<u32> {
        (self.arms() > 0).then(|| {
            u32::try_from(self.last_count.load(Ordering::Relaxed)).unwrap_or(u32::MAX)
        })
    }

    /// Number of `arm` calls.
    pub fn arms(&self) -> u64 {
        self.arms.load(Ordering::Relaxed)
    }

    /// Number of serviced pops.
    pub fn pops(&self) -> u64 {
        self.pops.load(Ordering::Relaxed)
    }

    /// Forget the pending deadline so the next pop forces a full resync.
    pub fn reset(&self, _irq: &IrqDisabled) {
        self.pending
            .store(AbsoluteTime::END_OF_ALL_TIME.0, Ordering::Release);
    }

    /// Arm the timer for `deadline` and return the count programmed.
    ///
    /// Supersedes any previously armed deadline.
    pub fn arm(
        &self,
        irq: &IrqDisabled,
        now: u64,
        deadline: AbsoluteTime,
        conversion: &TimerConversion,
        timer: &dyn OneShotTimer,
    ) -> u32 {
        let interval = deadline_to_interval(deadline.0, now, conversion);
        let count = conversion.interval_to_count(interval);

        self.pending.store(deadline.0, Ordering::Release);
        timer.program(count);
        self.last_count.store(u64::from(count), Ordering::Relaxed);
        self.arms.fetch_add(1, Ordering::Relaxed);

        trace!(
            cpu = %irq.cpu(),
            deadline = deadline.0,
            now,
            interval_ns = interval,
            count,
            "Armed one-shot timer"
        );
        count
    }

    /// Account for a timer interrupt observed at `now`.
    pub fn on_timer_interrupt(&self, irq: &IrqDisabled, now: u64, frame: InterruptFrame) -> TimerPop {
        let deadline = self.pending.load(Ordering::Acquire);
        let latency_ns = if now < deadline { 1 } else { now - deadline };
        self.pops.fetch_add(1, Ordering::Relaxed);

        let pop = TimerPop {
            cpu: irq.cpu(),
            now: AbsoluteTime(now),
            deadline: AbsoluteTime(deadline),
            latency_ns,
            reported_latency: 0i64.saturating_sub_unsigned(latency_ns),
            user_mode: frame.user_mode,
            instruction_pointer: frame.instruction_pointer,
        };
        trace!(
            cpu = %pop.cpu,
            latency = pop.reported_latency,
            ip = format_args!("{:#x}", pop.instruction_pointer),
            user_mode = pop.user_mode,
            "Timer interrupt"
        );
        pop
    }
}
