//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Building a clock over simulated hardware
//! - Masking interrupts the way an owning CPU would
//! - Tracking per-CPU monotonicity from reader threads

#![allow(dead_code)] // Not every scenario uses every helper

use rtclock_common::cpu::CpuId;
use rtclock_common::time::AbsoluteTime;
use rtclock_core::calibrate::Calibrator;
use rtclock_core::clock::RtClock;
use rtclock_core::hal::IrqGuard;
use rtclock_core::publish::PublishedTime;
use rtclock_core::sim::{RecordingDispatcher, SimCounter, SimInterrupts, SimTimer};
use std::sync::Arc;

/// 1 GHz counter: one cycle is one nanosecond (less one for saturation).
pub const GHZ: u64 = 1_000_000_000;

/// 100 MHz one-shot timer.
pub const TIMER_HZ: u64 = 100_000_000;

/// A clock with every piece of simulated hardware reachable.
pub struct SimRig {
    pub clock: Arc<RtClock>,
    pub counters: Vec<Arc<SimCounter>>,
    pub timers: Vec<Arc<SimTimer>>,
    pub irqs: Arc<SimInterrupts>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub published: Arc<PublishedTime>,
}

impl SimRig {
    /// `cpus` uncalibrated CPUs, counters starting at `initial`.
    pub fn new(cpus: usize, initial: u64) -> Self {
        let counters: Vec<_> = (0..cpus)
            .map(|_| Arc::new(SimCounter::new(initial)))
            .collect();
        let timers: Vec<_> = (0..cpus).map(|_| Arc::new(SimTimer::new())).collect();
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let published = Arc::new(PublishedTime::new());

        let mut builder = RtClock::builder()
            .dispatcher(dispatcher.clone())
            .publisher(published.clone());
        for (counter, timer) in counters.iter().zip(&timers) {
            builder = builder.cpu(counter.clone(), timer.clone());
        }

        Self {
            clock: Arc::new(builder.build().expect("rig builds")),
            counters,
            timers,
            irqs: Arc::new(SimInterrupts::new(cpus)),
            dispatcher,
            published,
        }
    }

    /// Calibrate and start every CPU at `counter_hz`, boot CPU first.
    pub fn booted(cpus: usize, counter_hz: u64) -> Self {
        let rig = Self::new(cpus, 0);
        let calibrator = Calibrator::new(counter_hz, TIMER_HZ);
        for cpu in 0..cpus {
            let guard = rig.mask(CpuId(cpu));
            rig.clock
                .calibrate(guard.token(), &calibrator)
                .expect("calibration succeeds");
            rig.clock
                .start_ticking(guard.token())
                .expect("ticking starts");
        }
        rig
    }

    /// Interrupts masked on `cpu` until the guard drops.
    pub fn mask(&self, cpu: CpuId) -> IrqGuard<'_, SimInterrupts> {
        IrqGuard::new(&self.irqs, cpu)
    }

    /// Counter of `cpu`.
    pub fn counter(&self, cpu: CpuId) -> &SimCounter {
        &self.counters[cpu.index()]
    }

    /// Current time on `cpu`.
    pub fn now(&self, cpu: CpuId) -> AbsoluteTime {
        self.clock.now(cpu).expect("cpu is calibrated")
    }
}

/// Per-CPU last-seen values for one reader.
#[derive(Debug)]
pub struct MonotonicTracker {
    last: Vec<u64>,
    pub reads: u64,
    pub violations: Vec<(CpuId, u64, u64)>,
}

impl MonotonicTracker {
    pub fn new(cpus: usize) -> Self {
        Self {
            last: vec![0; cpus],
            reads: 0,
            violations: Vec::new(),
        }
    }

    /// Record a reading; remembers it if it went backwards.
    pub fn observe(&mut self, cpu: CpuId, now: AbsoluteTime) {
        let last = &mut self.last[cpu.index()];
        if now.0 < *last {
            self.violations.push((cpu, *last, now.0));
        }
        *last = now.0;
        self.reads += 1;
    }
}
