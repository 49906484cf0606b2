//! Re-pointing a time base after counter discontinuities.
//!
//! Two events arrive from power management:
//!
//! - the counter stopped and resumed at an unknown offset (deep idle), with
//!   a freshly measured `(ns_base, cycle_base)` pair
//! - the counter was reset to zero (sleep/wake), with the nanotime to
//!   resume from
//!
//! A discontinuity report is adopted only if it moves "now" strictly
//! forward, so a stale or racing report can never make time go backwards.

use crate::hal::{CycleCounter, IrqDisabled};
use crate::publish::{SnapshotPublisher, TimeSnapshot};
use crate::timebase::{TimeBase, TimeBaseRecord};
use rtclock_common::cpu::CpuId;
use rtclock_common::error::{ClockError, ClockResult};
use serde::Serialize;
use tracing::{debug, error, warn};

/// Result of a discontinuity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RebaseOutcome {
    /// The proposed base was later and is now in effect.
    Adopted {
        /// "Now" under the previous record.
        old_now: u64,
        /// "Now" under the adopted record.
        new_now: u64,
    },
    /// The proposed base would have moved time backwards and was dropped.
    Rejected {
        /// "Now" under the retained record.
        current_now: u64,
        /// "Now" the report would have produced.
        proposed_now: u64,
    },
}

impl RebaseOutcome {
    /// Whether the record changed.
    #[must_use]
    pub fn is_adopted(&self) -> bool {
        matches!(self, Self::Adopted { .. })
    }
}

/// Rebase operations over one CPU's record.
pub struct Rebaser<'a> {
    cpu: CpuId,
    record: &'a TimeBaseRecord,
    counter: &'a dyn CycleCounter,
    publisher: &'a dyn SnapshotPublisher,
}

impl<'a> Rebaser<'a> {
    /// Bind the rebaser to `cpu`'s record, counter and publication sink.
    pub fn new(
        cpu: CpuId,
        record: &'a TimeBaseRecord,
        counter: &'a dyn CycleCounter,
        publisher: &'a dyn SnapshotPublisher,
    ) -> Self {
        Self {
            cpu,
            record,
            counter,
            publisher,
        }
    }

    /// The counter paused and resumed; adopt the new base if it is later.
    pub fn on_counter_discontinuity(
        &self,
        irq: &IrqDisabled,
        new_ns_base: u64,
        new_cycle_base: u64,
    ) -> RebaseOutcome {
        debug_assert_eq!(irq.cpu(), self.cpu, "rebase from a foreign CPU");

        let current = self.record.snapshot();
        let proposed = TimeBase {
            cycle_base: new_cycle_base,
            ns_base: new_ns_base,
            ..current
        };

        let counter = self.counter.read();
        let current_now = current.nanotime_at(counter);
        let proposed_now = proposed.nanotime_at(counter);

        if current_now < proposed_now {
            self.commit(irq, proposed);
            debug!(
                cpu = %self.cpu,
                old_now = current_now,
                new_now = proposed_now,
                "Adopted counter discontinuity"
            );
            RebaseOutcome::Adopted {
                old_now: current_now,
                new_now: proposed_now,
            }
        } else {
            warn!(
                cpu = %self.cpu,
                current_now,
                proposed_now,
                "Ignoring stale counter discontinuity"
            );
            RebaseOutcome::Rejected {
                current_now,
                proposed_now,
            }
        }
    }

    /// The counter restarted from zero; continue from `new_ns_base`.
    pub fn on_counter_reset(&self, irq: &IrqDisabled, new_ns_base: u64) -> TimeBase {
        debug_assert_eq!(irq.cpu(), self.cpu, "rebase from a foreign CPU");

        let base = TimeBase {
            cycle_base: self.counter.read(),
            ns_base: new_ns_base,
            ..self.record.snapshot()
        };
        self.commit(irq, base);
        debug!(
            cpu = %self.cpu,
            cycle_base = base.cycle_base,
            ns_base = new_ns_base,
            "Re-initialized time base after counter reset"
        );
        base
    }

    /// Counter frequency changes are not supported; the record is untouched.
    ///
    /// # Errors
    ///
    /// Always returns [`ClockError::FrequencyStepUnsupported`].
    pub fn on_frequency_step(&self, old_hz: u64, new_hz: u64) -> ClockResult<()> {
        error!(cpu = %self.cpu, old_hz, new_hz, "Counter frequency step is unsupported");
        Err(ClockError::FrequencyStepUnsupported { old_hz, new_hz })
    }

    /// Store `base` and re-publish it.
    pub(crate) fn commit(&self, irq: &IrqDisabled, base: TimeBase) {
        self.record.store(irq, base);
        self.publisher.publish(TimeSnapshot::from_base(
            self.cpu,
            base,
            self.record.generation(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_point::STANDARD_SHIFT;
    use crate::publish::PublishedTime;
    use crate::sim::SimCounter;

    // Half a nanosecond per cycle (2 GHz)
    const BASE: TimeBase = TimeBase {
        cycle_base: 0,
        ns_base: 1_000_000,
        scale: 1 << 31,
        shift: STANDARD_SHIFT,
    };

    fn irq() -> IrqDisabled {
        // SAFETY: test-only; no real interrupts are involved.
        unsafe { IrqDisabled::assume(CpuId::BOOT) }
    }

    fn fixture() -> (TimeBaseRecord, SimCounter, PublishedTime) {
        let record = TimeBaseRecord::new();
        record.store(&irq(), BASE);
        (record, SimCounter::new(2_000), PublishedTime::new())
    }

    #[test]
    fn test_later_discontinuity_adopted_exactly() {
        let (record, counter, published) = fixture();
        let rebaser = Rebaser::new(CpuId::BOOT, &record, &counter, &published);
        // Current now = 1_000_000 + 1_000
        let outcome = rebaser.on_counter_discontinuity(&irq(), 5_000_000, 2_000);

        assert_eq!(
            outcome,
            RebaseOutcome::Adopted {
                old_now: 1_001_000,
                new_now: 5_000_000
            }
        );
        let snap = record.snapshot();
        assert_eq!(snap.ns_base, 5_000_000);
        assert_eq!(snap.cycle_base, 2_000);
        assert_eq!(snap.scale, BASE.scale);
        assert_eq!(published.snapshot().ns_base, 5_000_000);
        assert_eq!(published.snapshot().generation, record.generation());
    }

    #[test]
    fn test_stale_discontinuity_leaves_record_unchanged() {
        let (record, counter, published) = fixture();
        let rebaser = Rebaser::new(CpuId::BOOT, &record, &counter, &published);
        let generation = record.generation();

        let outcome = rebaser.on_counter_discontinuity(&irq(), 900_000, 2_000);
        assert!(!outcome.is_adopted());
        assert_eq!(record.snapshot(), BASE);
        assert_eq!(record.generation(), generation);
        assert_eq!(published.publications(), 0);
    }

    #[test]
    fn test_equal_discontinuity_rejected() {
        let (record, counter, published) = fixture();
        let rebaser = Rebaser::new(CpuId::BOOT, &record, &counter, &published);
        let outcome = rebaser.on_counter_discontinuity(&irq(), 1_001_000, 2_000);
        assert!(matches!(outcome, RebaseOutcome::Rejected { .. }));
    }

    #[test]
    fn test_counter_reset_continues_from_new_base() {
        let (record, counter, published) = fixture();
        let rebaser = Rebaser::new(CpuId::BOOT, &record, &counter, &published);

        counter.reset();
        counter.advance(10);
        let base = rebaser.on_counter_reset(&irq(), 7_000_000);

        assert_eq!(base.cycle_base, 10);
        assert_eq!(record.read(&counter), 7_000_000);
        counter.advance(2_000);
        assert_eq!(record.read(&counter), 7_001_000);
        assert_eq!(published.snapshot().ns_base, 7_000_000);
    }

    #[test]
    fn test_frequency_step_unsupported() {
        let (record, counter, published) = fixture();
        let rebaser = Rebaser::new(CpuId::BOOT, &record, &counter, &published);
        let generation = record.generation();

        let err = rebaser.on_frequency_step(2_000_000_000, 1_000_000_000).unwrap_err();
        assert!(matches!(err, ClockError::FrequencyStepUnsupported { .. }));
        assert_eq!(record.generation(), generation);
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(RebaseOutcome::Rejected {
            current_now: 2,
            proposed_now: 1,
        })
        .unwrap();
        assert_eq!(json["outcome"], "rejected");
    }
}
