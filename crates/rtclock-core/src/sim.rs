//! Simulated hardware for tests and the daemon.
//!
//! Everything here is lock-free on the paths the clock engine calls,
//! except the recording collaborators, which keep their history behind a
//! mutex because they stand in for subsystems outside the engine.

use crate::deadline::TimerPop;
use crate::hal::{CalloutDispatcher, CycleCounter, InterruptMask, IrqDisabled, OneShotTimer};
use crate::publish::{SnapshotPublisher, TimeSnapshot};
use rtclock_common::cpu::CpuId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Manually driven cycle counter.
///
/// With a non-zero step, every read advances the counter by `step`
/// after returning its value, like a counter ticking between reads.
#[derive(Debug, Default)]
pub struct SimCounter {
    value: AtomicU64,
    step: AtomicU64,
}

impl SimCounter {
    /// Counter frozen at `initial`.
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            step: AtomicU64::new(0),
        }
    }

    /// Counter that advances by `step` on every read.
    pub fn with_step(initial: u64, step: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            step: AtomicU64::new(step),
        }
    }

    /// Jump to `value`.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    /// Move forward by `delta` cycles.
    pub fn advance(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::AcqRel);
    }

    /// Restart from zero, as after sleep.
    pub fn reset(&self) {
        self.set(0);
    }

    /// Current value without stepping.
    pub fn peek(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

impl CycleCounter for SimCounter {
    fn read(&self) -> u64 {
        match self.step.load(Ordering::Relaxed) {
            0 => self.value.load(Ordering::Acquire),
            step => self.value.fetch_add(step, Ordering::AcqRel),
        }
    }
}

/// One-shot timer that records what it was asked to do.
#[derive(Debug)]
pub struct SimTimer {
    /// Last programmed count; `u64::MAX` before the first program.
    last: AtomicU64,
    armed: AtomicBool,
    programs: AtomicU64,
    stops: AtomicU64,
}

impl SimTimer {
    /// Never programmed.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(u64::MAX),
            armed: AtomicBool::new(false),
            programs: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    /// Last programmed count.
    pub fn programmed(&self) -> Option<u32> {
        u32::try_from(self.last.load(Ordering::Acquire)).ok()
    }

    /// Whether a pop is pending.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Number of `program` calls.
    pub fn program_count(&self) -> u64 {
        self.programs.load(Ordering::Relaxed)
    }

    /// Number of `stop` calls.
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    /// The pending pop fired; the timer is one-shot so it disarms itself.
    pub fn fire(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }
}

impl Default for SimTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotTimer for SimTimer {
    fn program(&self, count: u32) {
        self.last.store(u64::from(count), Ordering::Release);
        self.armed.store(true, Ordering::Release);
        self.programs.fetch_add(1, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.armed.store(false, Ordering::Release);
        self.stops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-CPU interrupt enable flags.
#[derive(Debug)]
pub struct SimInterrupts {
    enabled: Box<[AtomicBool]>,
}

impl SimInterrupts {
    /// `cpus` CPUs, all with interrupts enabled.
    pub fn new(cpus: usize) -> Self {
        Self {
            enabled: (0..cpus).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    /// Whether delivery is enabled on `cpu`. Unknown CPUs report disabled.
    pub fn is_enabled(&self, cpu: CpuId) -> bool {
        self.enabled
            .get(cpu.index())
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

impl InterruptMask for SimInterrupts {
    fn mask(&self, cpu: CpuId) -> bool {
        self.enabled
            .get(cpu.index())
            .is_some_and(|flag| flag.swap(false, Ordering::AcqRel))
    }

    fn restore(&self, cpu: CpuId, was_enabled: bool) {
        if let Some(flag) = self.enabled.get(cpu.index()) {
            flag.store(was_enabled, Ordering::Release);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callout dispatcher that remembers every pop and resync request.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pops: Mutex<Vec<TimerPop>>,
    resyncs: Mutex<Vec<CpuId>>,
}

impl RecordingDispatcher {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pop delivered so far, in delivery order.
    pub fn pops(&self) -> Vec<TimerPop> {
        lock(&self.pops).clone()
    }

    /// Pops delivered on `cpu`.
    pub fn pops_for(&self, cpu: CpuId) -> Vec<TimerPop> {
        lock(&self.pops)
            .iter()
            .filter(|p| p.cpu == cpu)
            .copied()
            .collect()
    }

    /// CPUs that requested a deadline resync, in order.
    pub fn resyncs(&self) -> Vec<CpuId> {
        lock(&self.resyncs).clone()
    }
}

impl CalloutDispatcher for RecordingDispatcher {
    fn timer_expired(&self, _irq: &IrqDisabled, pop: &TimerPop) {
        lock(&self.pops).push(*pop);
    }

    fn resync_deadlines(&self, irq: &IrqDisabled) {
        lock(&self.resyncs).push(irq.cpu());
    }
}

/// Publisher that keeps every snapshot it receives.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    history: Mutex<Vec<TimeSnapshot>>,
}

impl RecordingPublisher {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// All snapshots, oldest first.
    pub fn history(&self) -> Vec<TimeSnapshot> {
        lock(&self.history).clone()
    }

    /// Most recent snapshot.
    pub fn latest(&self) -> Option<TimeSnapshot> {
        lock(&self.history).last().copied()
    }
}

impl SnapshotPublisher for RecordingPublisher {
    fn publish(&self, snapshot: TimeSnapshot) {
        lock(&self.history).push(snapshot);
    }
}
