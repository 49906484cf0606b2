//! Deadline arming and timer interrupt acceptance tests.
//!
//! Plays the callout subsystem: arm a deadline, let simulated time reach
//! it, deliver the interrupt, and check what the engine reports.
//!
//! # Acceptance Criteria
//!
//! - Past deadlines arm exactly the minimum interval
//! - Far deadlines arm exactly the maximum interval
//! - Latency is reported as a non-positive value, -1 for early pops
//! - Every serviced pop reaches the dispatcher and the latency histogram

use super::common::{SimRig, GHZ, TIMER_HZ};
use rtclock_common::cpu::CpuId;
use rtclock_common::time::{AbsoluteTime, NSEC_PER_SEC};
use rtclock_core::calibrate::Calibrator;
use rtclock_core::hal::InterruptFrame;
use std::time::Duration;

const PERIOD_NS: u64 = 1_000_000;

#[test]
fn test_periodic_ticks() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    let latencies = [0u64, 120, 5, 900, 40, 0, 333, 7, 61, 2];

    for (tick, late_by) in latencies.iter().enumerate() {
        let deadline = {
            let guard = rig.mask(cpu);
            let deadline = rig.now(cpu).saturating_add(PERIOD_NS);
            rig.clock.arm(guard.token(), deadline).unwrap();
            deadline
        };
        assert!(rig.timers[0].is_armed());

        // Counter cycles are nanoseconds minus one per second at 1 GHz
        let now = rig.now(cpu);
        rig.counter(cpu).advance(deadline.0 - now.0 + late_by);
        while rig.now(cpu) < deadline {
            rig.counter(cpu).advance(1);
        }
        assert!(rig.timers[0].fire());

        let guard = rig.mask(cpu);
        let frame = InterruptFrame {
            user_mode: tick % 3 == 0,
            instruction_pointer: 0xffff_8000_0000_0000 + tick as u64,
        };
        let pop = rig.clock.on_timer_interrupt(guard.token(), frame).unwrap();
        assert_eq!(pop.deadline, deadline);
        assert!(pop.reported_latency <= 0);
        assert!(pop.latency_ns >= *late_by, "tick {tick}");
        assert!(pop.latency_ns <= late_by + 1, "tick {tick}");
        assert_eq!(pop.user_mode, tick % 3 == 0);
    }

    let clock = rig.clock.cpu(cpu).unwrap();
    assert_eq!(clock.deadlines().arms(), latencies.len() as u64);
    assert_eq!(clock.deadlines().pops(), latencies.len() as u64);
    assert_eq!(rig.dispatcher.pops_for(cpu).len(), latencies.len());

    let latency = clock.latency();
    assert_eq!(latency.total(), latencies.len() as u64);
    assert_eq!(latency.early_count(), 0);
    assert!(latency.max().unwrap() >= Duration::from_nanos(900));
}

#[test]
fn test_past_and_far_deadlines_clamp() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    rig.counter(cpu).advance(10 * NSEC_PER_SEC);

    let constants = rig.clock.cpu(cpu).unwrap().constants().copied().unwrap();
    let timer = constants.timer;
    let guard = rig.mask(cpu);

    let past = rig.clock.arm(guard.token(), AbsoluteTime(1)).unwrap();
    assert_eq!(past, timer.interval_to_count(constants.min_decrementer_interval()));

    let now = rig.now(cpu);
    let at_now = rig.clock.arm(guard.token(), now).unwrap();
    assert_eq!(at_now, past);

    let far = rig
        .clock
        .arm(guard.token(), AbsoluteTime::END_OF_ALL_TIME)
        .unwrap();
    assert_eq!(far, timer.interval_to_count(constants.max_decrementer_interval()));
    assert_eq!(rig.timers[0].programmed(), Some(far));
}

#[test]
fn test_max_interval_matches_register_width() {
    let rig = SimRig::booted(1, GHZ);
    let constants = rig.clock.cpu(CpuId(0)).unwrap().constants().copied().unwrap();
    // 0x7fff_ffff ticks at 100 MHz is just under 21.5 s
    let max = constants.max_decrementer_interval();
    assert!(max > 21 * NSEC_PER_SEC && max < 22 * NSEC_PER_SEC, "{max}");
    assert_eq!(constants.min_decrementer_interval(), 1_000);
    assert_eq!(constants.timer.frequency_hz, TIMER_HZ);
}

#[test]
fn test_floor_above_range_is_lowered() {
    let rig = SimRig::new(1, 0);
    let mut calibrator = Calibrator::new(GHZ, TIMER_HZ);
    calibrator.max_count = 1_000;
    calibrator.min_interval_ns = NSEC_PER_SEC;

    let guard = rig.mask(CpuId(0));
    let constants = rig.clock.calibrate(guard.token(), &calibrator).unwrap();
    assert_eq!(
        constants.min_decrementer_interval(),
        constants.max_decrementer_interval()
    );
}

#[test]
fn test_early_pop() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    let guard = rig.mask(cpu);
    let deadline = rig.now(cpu).saturating_add(PERIOD_NS);
    rig.clock.arm(guard.token(), deadline).unwrap();

    rig.counter(cpu).advance(PERIOD_NS / 2);
    let pop = rig
        .clock
        .on_timer_interrupt(guard.token(), InterruptFrame::default())
        .unwrap();
    assert!(pop.is_early());
    assert_eq!(pop.latency_ns, 1);
    assert_eq!(pop.reported_latency, -1);

    let latency = rig.clock.cpu(cpu).unwrap().latency();
    assert_eq!(latency.early_count(), 1);
    assert_eq!(latency.total(), 1);
}

#[test]
fn test_new_deadline_supersedes_old() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    let guard = rig.mask(cpu);
    let now = rig.now(cpu);

    let first = rig.clock.arm(guard.token(), now.saturating_add(5 * PERIOD_NS)).unwrap();
    let second = rig.clock.arm(guard.token(), now.saturating_add(PERIOD_NS)).unwrap();
    assert!(second < first);
    assert_eq!(rig.timers[0].programmed(), Some(second));
    assert_eq!(
        rig.clock.cpu(cpu).unwrap().deadlines().pending_deadline(),
        now.saturating_add(PERIOD_NS)
    );
}

#[test]
fn test_delay_until_spins_to_deadline() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    let deadline = rig.now(cpu).saturating_add(50_000);

    let counter = std::sync::Arc::clone(&rig.counters[0]);
    let ticker = std::thread::spawn(move || {
        for _ in 0..100 {
            counter.advance(1_000);
            std::thread::sleep(Duration::from_micros(50));
        }
    });

    let reached = rig.clock.delay_until(cpu, deadline).unwrap();
    assert!(reached >= deadline);
    ticker.join().unwrap();
}
