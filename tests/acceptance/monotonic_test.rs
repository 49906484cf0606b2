//! Monotonicity acceptance tests.
//!
//! Reader threads hammer every CPU's clock while the owning CPUs rebase
//! their time bases. No reader may ever see time go backwards on a CPU.
//!
//! # Acceptance Criteria
//!
//! - Zero backwards reads across fresh and stale discontinuity reports
//! - Stale reports never change the record
//! - Published snapshots stay consistent with the record generation

use super::common::{MonotonicTracker, SimRig, GHZ};
use rtclock_common::cpu::CpuId;
use rtclock_core::calibrate::Calibrator;
use rtclock_core::clock::RtClock;
use rtclock_core::hal::{CycleCounter, IrqGuard};
use rtclock_core::host::HostCounter;
use rtclock_core::publish::PublishedTime;
use rtclock_core::rebase::RebaseOutcome;
use rtclock_core::sim::{RecordingDispatcher, SimInterrupts, SimTimer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const CPUS: usize = 4;
const READERS: usize = 3;
const REBASES_PER_CPU: u64 = 2_000;

#[test]
fn test_readers_never_see_time_go_backwards() {
    let rig = Arc::new(SimRig::booted(CPUS, GHZ));
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(CPUS + READERS));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let rig = Arc::clone(&rig);
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut tracker = MonotonicTracker::new(CPUS);
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    for cpu in 0..CPUS {
                        tracker.observe(CpuId(cpu), rig.now(CpuId(cpu)));
                    }
                }
                tracker
            })
        })
        .collect();

    let owners: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let rig = Arc::clone(&rig);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let cpu = CpuId(cpu);
                let mut adopted = 0u64;
                let mut rejected = 0u64;
                barrier.wait();
                for i in 0..REBASES_PER_CPU {
                    rig.counter(cpu).advance(1_000 + i % 7);

                    let guard = rig.mask(cpu);
                    let now = rig.now(cpu).0;
                    let cycle_base = rig.counter(cpu).peek();
                    // Odd iterations replay a report that is already stale
                    let ns_base = if i % 2 == 0 { now + 5_000 } else { now.saturating_sub(5_000) };
                    match rig
                        .clock
                        .on_counter_discontinuity(guard.token(), ns_base, cycle_base)
                        .unwrap()
                    {
                        RebaseOutcome::Adopted { .. } => adopted += 1,
                        RebaseOutcome::Rejected { .. } => rejected += 1,
                    }
                }
                (adopted, rejected)
            })
        })
        .collect();

    for owner in owners {
        let (adopted, rejected) = owner.join().unwrap();
        assert_eq!(adopted, REBASES_PER_CPU / 2);
        assert_eq!(rejected, REBASES_PER_CPU / 2);
    }
    done.store(true, Ordering::Release);

    let mut reads = 0;
    for reader in readers {
        let tracker = reader.join().unwrap();
        assert!(tracker.violations.is_empty(), "{:?}", tracker.violations);
        reads += tracker.reads;
    }
    assert!(reads > 0);
}

#[test]
fn test_stale_report_leaves_record_untouched() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    rig.counter(cpu).advance(10_000_000);

    let record = rig.clock.cpu(cpu).unwrap().record();
    let before = record.snapshot();
    let generation = record.generation();
    let publications = rig.published.publications();

    let guard = rig.mask(cpu);
    let outcome = rig
        .clock
        .on_counter_discontinuity(guard.token(), 1_000, rig.counter(cpu).peek())
        .unwrap();

    assert!(!outcome.is_adopted());
    assert_eq!(record.snapshot(), before);
    assert_eq!(record.generation(), generation);
    assert_eq!(rig.published.publications(), publications);
}

#[test]
fn test_fresh_report_is_adopted_exactly() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    rig.counter(cpu).advance(10_000_000);

    let guard = rig.mask(cpu);
    let cycle_base = rig.counter(cpu).peek();
    let outcome = rig
        .clock
        .on_counter_discontinuity(guard.token(), 50_000_000, cycle_base)
        .unwrap();

    assert!(outcome.is_adopted());
    let record = rig.clock.cpu(cpu).unwrap().record().snapshot();
    assert_eq!(record.ns_base, 50_000_000);
    assert_eq!(record.cycle_base, cycle_base);
    assert_eq!(rig.now(cpu).0, 50_000_000);
    assert_eq!(rig.published.snapshot().ns_base, 50_000_000);
}

#[test]
fn test_idempotent_store() {
    let rig = SimRig::booted(1, GHZ);
    let cpu = CpuId(0);
    rig.counter(cpu).advance(1_000_000);
    let record = rig.clock.cpu(cpu).unwrap().record();
    let base = record.snapshot();
    let before = rig.now(cpu);

    let guard = rig.mask(cpu);
    record.store(guard.token(), base);
    record.store(guard.token(), base);
    assert_eq!(rig.now(cpu), before);
    assert_eq!(record.generation() % 2, 0);
}

/// Host-clock soak: real counters, real sleeps, concurrent readers.
#[test]
#[ignore = "Runs for several seconds against the host clock"]
fn test_host_clock_soak() {
    const SOAK: Duration = Duration::from_secs(5);
    let cpus = 2;

    let counters: Vec<_> = (0..cpus)
        .map(|_| Arc::new(HostCounter::new(2_400_000_000).unwrap()))
        .collect();
    let timers: Vec<_> = (0..cpus).map(|_| Arc::new(SimTimer::new())).collect();
    let mut builder = RtClock::builder()
        .dispatcher(Arc::new(RecordingDispatcher::new()))
        .publisher(Arc::new(PublishedTime::new()));
    for (c, t) in counters.iter().zip(&timers) {
        builder = builder.cpu(c.clone(), t.clone());
    }
    let clock = Arc::new(builder.build().unwrap());
    let irqs = Arc::new(SimInterrupts::new(cpus));

    let calibrator = Calibrator::new(2_400_000_000, 24_000_000);
    for cpu in 0..cpus {
        let guard = IrqGuard::new(&*irqs, CpuId(cpu));
        clock.calibrate(guard.token(), &calibrator).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let clock = Arc::clone(&clock);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut tracker = MonotonicTracker::new(cpus);
            while !done.load(Ordering::Acquire) {
                for cpu in 0..cpus {
                    tracker.observe(CpuId(cpu), clock.now(CpuId(cpu)).unwrap());
                }
            }
            tracker
        })
    };

    let started = Instant::now();
    let mut rounds = 0u64;
    while started.elapsed() < SOAK {
        for (cpu, counter) in counters.iter().enumerate() {
            let cpu = CpuId(cpu);
            counter.pause();
            thread::sleep(Duration::from_millis(1));
            counter.resume();

            let guard = IrqGuard::new(&*irqs, cpu);
            let now = clock.now(cpu).unwrap().0;
            let outcome = clock
                .on_counter_discontinuity(guard.token(), now + 1_000_000, counter.read())
                .unwrap();
            assert!(outcome.is_adopted());
        }
        rounds += 1;
    }
    done.store(true, Ordering::Release);

    let tracker = reader.join().unwrap();
    assert!(rounds > 0);
    assert!(tracker.violations.is_empty(), "{:?}", tracker.violations);
}
