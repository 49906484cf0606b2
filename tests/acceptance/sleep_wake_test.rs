//! Sleep/wake acceptance tests.
//!
//! Drives a CPU through the full power cycle: stop the timer, let the
//! counter restart from zero, rebase onto the platform's notion of now
//! and re-arm.
//!
//! # Acceptance Criteria
//!
//! - Suspend stops the timer and forgets the pending deadline
//! - Time continues forward from the reported base after the counter reset
//! - Resume asks the dispatcher to re-arm
//! - Repeated cycles never run time backwards

use super::common::{MonotonicTracker, SimRig, GHZ};
use rtclock_common::cpu::CpuId;
use rtclock_common::time::{AbsoluteTime, NSEC_PER_MSEC, NSEC_PER_SEC};
use rtclock_core::hal::InterruptFrame;

/// Sleep `cpu` for `slept_ns`, wake with the counter at zero.
fn sleep_wake(rig: &SimRig, cpu: CpuId, slept_ns: u64) -> AbsoluteTime {
    let guard = rig.mask(cpu);
    let before = rig.now(cpu);
    rig.clock.suspend(guard.token()).unwrap();

    rig.counter(cpu).reset();
    let wake_ns = before.0 + slept_ns;
    rig.clock.on_counter_reset(guard.token(), wake_ns).unwrap();
    rig.clock.resume(guard.token()).unwrap();
    AbsoluteTime(wake_ns)
}

#[test]
fn test_suspend_stops_timer() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    let guard = rig.mask(cpu);
    rig.clock
        .arm(guard.token(), rig.now(cpu).saturating_add(NSEC_PER_MSEC))
        .unwrap();
    assert!(rig.timers[0].is_armed());

    rig.clock.suspend(guard.token()).unwrap();
    assert!(!rig.timers[0].is_armed());
    assert_eq!(rig.timers[0].stop_count(), 1);
    assert_eq!(
        rig.clock.cpu(cpu).unwrap().deadlines().pending_deadline(),
        AbsoluteTime::END_OF_ALL_TIME
    );
}

#[test]
fn test_time_continues_after_counter_reset() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    rig.counter(cpu).advance(5 * NSEC_PER_SEC);

    let wake = sleep_wake(&rig, cpu, 30 * NSEC_PER_SEC);
    assert_eq!(rig.now(cpu), wake);

    let record = rig.clock.cpu(cpu).unwrap().record().snapshot();
    assert_eq!(record.cycle_base, 0);
    assert_eq!(record.ns_base, wake.0);

    let published = rig.published.snapshot();
    assert_eq!(published.cycle_base, 0);
    assert_eq!(published.ns_base, wake.0);

    rig.counter(cpu).advance(NSEC_PER_MSEC + 1);
    assert_eq!(rig.now(cpu), wake.saturating_add(NSEC_PER_MSEC));
}

#[test]
fn test_resume_resyncs_deadlines() {
    let rig = SimRig::booted(2, GHZ);
    let boot_resyncs = rig.dispatcher.resyncs().len();
    assert_eq!(boot_resyncs, 2);

    sleep_wake(&rig, CpuId(1), NSEC_PER_SEC);
    assert_eq!(
        rig.dispatcher.resyncs()[boot_resyncs..],
        [CpuId(1)]
    );

    // The first pop after wake is measured against no deadline at all
    let guard = rig.mask(CpuId(1));
    let deadline = rig.now(CpuId(1)).saturating_add(NSEC_PER_MSEC);
    rig.clock.arm(guard.token(), deadline).unwrap();
    rig.counter(CpuId(1)).advance(2 * NSEC_PER_MSEC);
    let pop = rig
        .clock
        .on_timer_interrupt(guard.token(), InterruptFrame::default())
        .unwrap();
    assert_eq!(pop.deadline, deadline);
    assert!(!pop.is_early());
}

#[test]
fn test_other_cpus_unaffected_by_sleep() {
    let rig = SimRig::booted(2, GHZ);
    rig.counter(CpuId(0)).advance(NSEC_PER_SEC);
    let other = rig.clock.cpu(CpuId(0)).unwrap().record().snapshot();

    sleep_wake(&rig, CpuId(1), 10 * NSEC_PER_SEC);
    assert_eq!(rig.clock.cpu(CpuId(0)).unwrap().record().snapshot(), other);
    assert_eq!(rig.timers[0].stop_count(), 0);
}

#[test]
fn test_repeated_cycles_are_monotonic() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    let mut tracker = MonotonicTracker::new(1);

    for cycle in 0..50u64 {
        for _ in 0..10 {
            rig.counter(cpu).advance(NSEC_PER_MSEC);
            tracker.observe(cpu, rig.now(cpu));
        }
        sleep_wake(&rig, cpu, (cycle + 1) * NSEC_PER_MSEC);
        tracker.observe(cpu, rig.now(cpu));
    }

    assert!(tracker.violations.is_empty(), "{:?}", tracker.violations);
    assert_eq!(tracker.reads, 50 * 11);
    assert_eq!(rig.timers[0].stop_count(), 50);
    // One resync from start_ticking, one per wake
    assert_eq!(rig.dispatcher.resyncs().len(), 51);
}
