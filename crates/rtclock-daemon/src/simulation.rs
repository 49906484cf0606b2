//! The daemon workload: simulated CPUs driving the engine in real time.
//!
//! Each CPU has a [`HostCounter`] running at the configured frequency and a
//! [`SimTimer`]. One worker thread per CPU arms `now + tick_period`, waits
//! for the deadline and delivers the timer interrupt. Idle and sleep
//! episodes stop the counter and report new bases measured against
//! [`host_nanos`], which plays the platform timer.

use crate::signals::ShutdownFlag;
use anyhow::{anyhow, Context, Result};
use rtclock_common::config::ClockConfig;
use rtclock_common::cpu::CpuId;
use rtclock_common::time::AbsoluteTime;
use rtclock_core::calibrate::Calibrator;
use rtclock_core::clock::RtClock;
use rtclock_core::deadline::TimerPop;
use rtclock_core::hal::{CalloutDispatcher, CycleCounter, InterruptFrame, IrqDisabled, IrqGuard};
use rtclock_core::host::{host_nanos, pin_current_thread, HostCounter};
use rtclock_core::publish::PublishedTime;
use rtclock_core::rebase::RebaseOutcome;
use rtclock_core::sim::{SimInterrupts, SimTimer};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Remaining time below which a worker spins instead of sleeping.
const SPIN_WINDOW: Duration = Duration::from_micros(200);

/// Dispatcher that counts what the engine hands it, per CPU.
#[derive(Debug)]
pub struct TickDispatcher {
    pops: Box<[AtomicU64]>,
    resyncs: Box<[AtomicU64]>,
    worst_latency_ns: AtomicU64,
}

impl TickDispatcher {
    /// Counters for `cpus` CPUs.
    pub fn new(cpus: usize) -> Self {
        Self {
            pops: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            resyncs: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            worst_latency_ns: AtomicU64::new(0),
        }
    }

    /// Pops delivered on `cpu`.
    pub fn pops(&self, cpu: CpuId) -> u64 {
        self.pops
            .get(cpu.index())
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Resync requests from `cpu`.
    pub fn resyncs(&self, cpu: CpuId) -> u64 {
        self.resyncs
            .get(cpu.index())
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Worst service latency seen on any CPU.
    pub fn worst_latency_ns(&self) -> u64 {
        self.worst_latency_ns.load(Ordering::Relaxed)
    }
}

impl CalloutDispatcher for TickDispatcher {
    fn timer_expired(&self, irq: &IrqDisabled, pop: &TimerPop) {
        if let Some(c) = self.pops.get(irq.cpu().index()) {
            c.fetch_add(1, Ordering::Relaxed);
        }
        if !pop.is_early() {
            self.worst_latency_ns
                .fetch_max(pop.latency_ns, Ordering::Relaxed);
        }
    }

    fn resync_deadlines(&self, irq: &IrqDisabled) {
        if let Some(c) = self.resyncs.get(irq.cpu().index()) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// What one worker did.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerStats {
    /// CPU the worker drove.
    pub cpu: CpuId,
    /// Ticks completed.
    pub ticks: u64,
    /// Timer interrupts delivered.
    pub interrupts: u64,
    /// Discontinuity reports adopted.
    pub rebases_adopted: u64,
    /// Discontinuity reports rejected as stale.
    pub rebases_rejected: u64,
    /// Sleep/wake cycles.
    pub sleeps: u64,
}

/// What the reader threads saw.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReaderStats {
    /// Successful clock reads.
    pub reads: u64,
    /// Reads that went backwards on the same CPU.
    pub violations: u64,
}

impl ReaderStats {
    fn merge(&mut self, other: ReaderStats) {
        self.reads += other.reads;
        self.violations += other.violations;
    }
}

/// Result of a full run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Per-CPU worker results, calibrated CPUs only.
    pub workers: Vec<WorkerStats>,
    /// Combined reader results.
    pub readers: ReaderStats,
    /// CPUs whose calibration failed.
    pub failed_cpus: Vec<CpuId>,
    /// The run stopped on a signal.
    pub interrupted: bool,
    /// Wall time of the workload.
    pub elapsed: Duration,
}

/// Engine plus simulated hardware.
pub struct Simulation {
    config: ClockConfig,
    clock: RtClock,
    counters: Vec<Arc<HostCounter>>,
    timers: Vec<Arc<SimTimer>>,
    irqs: SimInterrupts,
    dispatcher: Arc<TickDispatcher>,
    published: Arc<PublishedTime>,
    /// Held for writing while a CPU is asleep; a sleeping CPU runs no code,
    /// so nothing may read its clock.
    online: Vec<RwLock<()>>,
    reference_origin: u64,
}

impl Simulation {
    /// Build the clock and its hardware from `config`.
    ///
    /// # Errors
    ///
    /// Host clock unavailable or an inconsistent configuration.
    pub fn new(config: ClockConfig) -> Result<Self> {
        let cpus = config.cpus;
        let counters = (0..cpus)
            .map(|_| HostCounter::new(config.counter.frequency_hz).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to create host counters")?;
        let timers: Vec<_> = (0..cpus).map(|_| Arc::new(SimTimer::new())).collect();
        let dispatcher = Arc::new(TickDispatcher::new(cpus));
        let published = Arc::new(PublishedTime::new());

        let mut builder = RtClock::builder()
            .dispatcher(dispatcher.clone())
            .publisher(published.clone())
            .histogram_size(config.metrics.histogram_size);
        for (counter, timer) in counters.iter().zip(&timers) {
            builder = builder.cpu(counter.clone(), timer.clone());
        }
        let clock = builder.build().context("Failed to build clock")?;

        Ok(Self {
            clock,
            counters,
            timers,
            irqs: SimInterrupts::new(cpus),
            dispatcher,
            published,
            online: (0..cpus).map(|_| RwLock::new(())).collect(),
            reference_origin: host_nanos(),
            config,
        })
    }

    /// The engine.
    pub fn clock(&self) -> &RtClock {
        &self.clock
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &TickDispatcher {
        &self.dispatcher
    }

    /// The published snapshot.
    pub fn published(&self) -> &PublishedTime {
        &self.published
    }

    /// The configuration the simulation runs with.
    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Reference time since boot, as the platform timer would report it.
    fn reference_now(&self) -> u64 {
        host_nanos().saturating_sub(self.reference_origin)
    }

    /// Calibrate every CPU, boot CPU first, and start the ones that succeed.
    ///
    /// Returns the CPUs that failed calibration.
    ///
    /// # Errors
    ///
    /// Only lifecycle errors; calibration failures are collected.
    pub fn boot(&self) -> Result<Vec<CpuId>> {
        let calibrator = Calibrator::from_config(&self.config);
        let mut failed = Vec::new();

        for index in 0..self.clock.cpu_count() {
            let cpu = CpuId(index);
            let guard = IrqGuard::new(&self.irqs, cpu);
            match self.clock.calibrate(guard.token(), &calibrator) {
                Ok(_) => self
                    .clock
                    .start_ticking(guard.token())
                    .with_context(|| format!("Failed to start ticking on {cpu}"))?,
                Err(e) => {
                    error!(%cpu, error = %e, "CPU left out of the run");
                    failed.push(cpu);
                }
            }
        }
        Ok(failed)
    }

    /// Boot, then run workers and readers until the workload completes or
    /// `shutdown` is requested.
    ///
    /// # Errors
    ///
    /// Any engine error inside a worker, or a panicked thread.
    pub fn run(&self, shutdown: &ShutdownFlag) -> Result<RunOutcome> {
        let failed_cpus = self.boot()?;
        let active: Vec<CpuId> = (0..self.clock.cpu_count())
            .map(CpuId)
            .filter(|cpu| !failed_cpus.contains(cpu))
            .collect();
        info!(
            cpus = active.len(),
            failed = failed_cpus.len(),
            ticks = self.config.simulation.ticks,
            readers = self.config.simulation.reader_threads,
            "Starting workload"
        );

        let started = Instant::now();
        let done = AtomicBool::new(false);

        let (workers, readers) = thread::scope(|s| {
            let reader_handles: Vec<_> = (0..self.config.simulation.reader_threads)
                .map(|_| s.spawn(|| self.reader(&done)))
                .collect();
            let worker_handles: Vec<_> = active
                .iter()
                .map(|&cpu| s.spawn(move || self.worker(cpu, shutdown)))
                .collect();

            let workers: Vec<Result<WorkerStats>> = worker_handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("worker panicked"))))
                .collect();
            done.store(true, Ordering::Release);

            let mut readers = ReaderStats::default();
            let mut reader_panicked = false;
            for h in reader_handles {
                match h.join() {
                    Ok(stats) => readers.merge(stats),
                    Err(_) => reader_panicked = true,
                }
            }
            (workers, (readers, reader_panicked))
        });

        let (readers, reader_panicked) = readers;
        if reader_panicked {
            return Err(anyhow!("reader thread panicked"));
        }
        let workers = workers.into_iter().collect::<Result<Vec<_>>>()?;

        Ok(RunOutcome {
            workers,
            readers,
            failed_cpus,
            interrupted: shutdown.requested(),
            elapsed: started.elapsed(),
        })
    }

    fn worker(&self, cpu: CpuId, shutdown: &ShutdownFlag) -> Result<WorkerStats> {
        if self.config.simulation.pin_threads {
            pin_current_thread(cpu)?;
        }
        let sim = &self.config.simulation;
        let period_ns = u64::try_from(sim.tick_period.as_nanos()).unwrap_or(u64::MAX);
        let timer = &self.timers[cpu.index()];

        let mut stats = WorkerStats {
            cpu,
            ..WorkerStats::default()
        };
        let mut stale_next = false;

        for tick in 1..=sim.ticks {
            if shutdown.requested() {
                warn!(%cpu, tick, "Worker stopping early");
                break;
            }

            let (now, deadline) = {
                let guard = IrqGuard::new(&self.irqs, cpu);
                let now = self.clock.now(cpu)?;
                let deadline = now.saturating_add(period_ns);
                self.clock.arm(guard.token(), deadline)?;
                (now, deadline)
            };
            self.wait_until(cpu, now, deadline)?;

            {
                let guard = IrqGuard::new(&self.irqs, cpu);
                if timer.fire() {
                    let frame = InterruptFrame {
                        user_mode: tick % 2 == 0,
                        instruction_pointer: tick,
                    };
                    self.clock.on_timer_interrupt(guard.token(), frame)?;
                    stats.interrupts += 1;
                }
            }
            stats.ticks = tick;

            if sim.idle_every > 0 && tick % sim.idle_every == 0 {
                match self.idle(cpu, stale_next)? {
                    RebaseOutcome::Adopted { .. } => stats.rebases_adopted += 1,
                    RebaseOutcome::Rejected { .. } => stats.rebases_rejected += 1,
                }
                stale_next = !stale_next;
            }

            if cpu == CpuId::BOOT && sim.sleep_at_tick == Some(tick) {
                self.sleep_wake(cpu)?;
                stats.sleeps += 1;
            }
        }

        debug!(%cpu, ticks = stats.ticks, "Worker finished");
        Ok(stats)
    }

    fn wait_until(&self, cpu: CpuId, now: AbsoluteTime, deadline: AbsoluteTime) -> Result<()> {
        let remaining = Duration::from_nanos(deadline.0.saturating_sub(now.0));
        if remaining > SPIN_WINDOW {
            thread::sleep(remaining - SPIN_WINDOW);
        }
        self.clock.delay_until(cpu, deadline)?;
        Ok(())
    }

    /// Deep idle: the counter stops, then a new base is reported. Stale
    /// reports claim a time in the past and must be rejected.
    fn idle(&self, cpu: CpuId, stale: bool) -> Result<RebaseOutcome> {
        let counter = &self.counters[cpu.index()];
        let idle = self.config.simulation.idle_duration;

        counter.pause();
        thread::sleep(idle);
        counter.resume();

        let guard = IrqGuard::new(&self.irqs, cpu);
        let cycle_base = counter.read();
        let ns_base = if stale {
            let idle_ns = u64::try_from(idle.as_nanos()).unwrap_or(u64::MAX);
            self.clock.now(cpu)?.0.saturating_sub(idle_ns.max(1))
        } else {
            self.reference_now()
        };
        Ok(self
            .clock
            .on_counter_discontinuity(guard.token(), ns_base, cycle_base)?)
    }

    /// Sleep: timer stopped, counter lost, base re-initialized on wake.
    fn sleep_wake(&self, cpu: CpuId) -> Result<()> {
        let counter = &self.counters[cpu.index()];
        let _offline = self.online[cpu.index()]
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        {
            let guard = IrqGuard::new(&self.irqs, cpu);
            self.clock.suspend(guard.token())?;
        }
        counter.pause();
        thread::sleep(self.config.simulation.sleep_duration);
        counter.reset();

        let guard = IrqGuard::new(&self.irqs, cpu);
        let base = self
            .clock
            .on_counter_reset(guard.token(), self.reference_now())?;
        self.clock.resume(guard.token())?;
        info!(%cpu, ns_base = base.ns_base, "Woke from sleep");
        Ok(())
    }

    fn reader(&self, done: &AtomicBool) -> ReaderStats {
        let mut stats = ReaderStats::default();
        let mut last = vec![0u64; self.clock.cpu_count()];

        while !done.load(Ordering::Acquire) {
            for (index, gate) in self.online.iter().enumerate() {
                let cpu = CpuId(index);
                let _online = gate.read().unwrap_or_else(PoisonError::into_inner);
                let Ok(now) = self.clock.now(cpu) else {
                    continue;
                };
                if now.0 < last[index] {
                    stats.violations += 1;
                    error!(%cpu, previous = last[index], now = now.0, "Clock went backwards");
                }
                last[index] = now.0;
                stats.reads += 1;
            }
            thread::yield_now();
        }
        stats
    }
}
