//! Per-CPU clocks and the system-wide facade.
//!
//! [`RtClock`] owns one [`CpuClock`] per logical CPU together with the
//! shared collaborators (callout dispatcher, snapshot publisher). Mutating
//! entry points take an [`IrqDisabled`] token and act on `irq.cpu()`;
//! reads take an explicit [`CpuId`] and may run anywhere.
//!
//! Per-CPU lifecycle:
//!
//! ```text
//!  UNCALIBRATED ──calibrate──▶ CALIBRATED ──start_ticking──▶ TICKING
//!        │
//!        └──calibration error──▶ FAILED
//! ```

use crate::calibrate::{CalibrationConstants, Calibrator};
use crate::deadline::{DeadlineScheduler, TimerPop};
use crate::hal::{CalloutDispatcher, CycleCounter, InterruptFrame, IrqDisabled, OneShotTimer};
use crate::percpu::PerCpu;
use crate::publish::SnapshotPublisher;
use crate::rebase::{RebaseOutcome, Rebaser};
use crate::timebase::{TimeBase, TimeBaseRecord};
use rtclock_common::cpu::CpuId;
use rtclock_common::error::{ClockError, ClockResult};
use rtclock_common::metrics::{LatencyHistogram, LatencySnapshot};
use rtclock_common::state::{ClockState, ClockStateCell};
use rtclock_common::time::{
    absolutetime_to_microtime, absolutetime_to_nanotime, AbsoluteTime, SecsMicros, SecsNanos,
};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

/// Default per-CPU latency history.
pub const DEFAULT_HISTOGRAM_SIZE: usize = 10_000;

/// Hardware a single CPU brings to the clock.
#[derive(Clone)]
pub struct CpuHardware {
    /// The CPU's cycle counter.
    pub counter: Arc<dyn CycleCounter>,
    /// The CPU's one-shot timer.
    pub timer: Arc<dyn OneShotTimer>,
}

impl CpuHardware {
    /// Bundle a counter and timer.
    pub fn new(counter: Arc<dyn CycleCounter>, timer: Arc<dyn OneShotTimer>) -> Self {
        Self { counter, timer }
    }
}

/// Everything one CPU owns.
pub struct CpuClock {
    cpu: CpuId,
    record: TimeBaseRecord,
    constants: OnceLock<CalibrationConstants>,
    state: ClockStateCell,
    deadlines: DeadlineScheduler,
    latency: LatencyHistogram,
    hw: CpuHardware,
}

impl CpuClock {
    fn new(cpu: CpuId, hw: CpuHardware, histogram_size: usize) -> Self {
        Self {
            cpu,
            record: TimeBaseRecord::new(),
            constants: OnceLock::new(),
            state: ClockStateCell::new(),
            deadlines: DeadlineScheduler::new(),
            latency: LatencyHistogram::new(histogram_size),
            hw,
        }
    }

    /// This CPU's id.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Lifecycle state.
    pub fn state(&self) -> ClockState {
        self.state.state()
    }

    /// The time-base record.
    pub fn record(&self) -> &TimeBaseRecord {
        &self.record
    }

    /// Calibration results, once calibrated.
    pub fn constants(&self) -> Option<&CalibrationConstants> {
        self.constants.get()
    }

    /// Deadline bookkeeping.
    pub fn deadlines(&self) -> &DeadlineScheduler {
        &self.deadlines
    }

    /// Interrupt service latency history.
    pub fn latency(&self) -> &LatencyHistogram {
        &self.latency
    }

    /// Current nanotime, without a lifecycle check.
    #[inline]
    pub fn read(&self) -> AbsoluteTime {
        AbsoluteTime(self.record.read(&*self.hw.counter))
    }

    fn calibrated(&self) -> ClockResult<&CalibrationConstants> {
        if !self.state.state().is_calibrated() {
            return Err(ClockError::NotCalibrated(self.cpu));
        }
        self.constants
            .get()
            .ok_or(ClockError::NotCalibrated(self.cpu))
    }

    fn rebaser<'a>(&'a self, publisher: &'a dyn SnapshotPublisher) -> Rebaser<'a> {
        Rebaser::new(self.cpu, &self.record, &*self.hw.counter, publisher)
    }

    /// Point-in-time summary for diagnostics.
    pub fn report(&self) -> CpuReport {
        CpuReport {
            cpu: self.cpu,
            state: self.state(),
            now: self
                .state()
                .is_calibrated()
                .then(|| self.read()),
            generation: self.record.generation(),
            constants: self.constants.get().copied(),
            arms: self.deadlines.arms(),
            pops: self.deadlines.pops(),
            last_count: self.deadlines.last_count(),
            latency: self.latency.snapshot(),
        }
    }
}

/// Serializable per-CPU diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CpuReport {
    /// CPU id.
    pub cpu: CpuId,
    /// Lifecycle state.
    pub state: ClockState,
    /// Nanotime at report time, if calibrated.
    pub now: Option<AbsoluteTime>,
    /// Time-base generation.
    pub generation: u64,
    /// Calibration results.
    pub constants: Option<CalibrationConstants>,
    /// `arm` calls.
    pub arms: u64,
    /// Serviced pops.
    pub pops: u64,
    /// Most recently programmed count.
    pub last_count: Option<u32>,
    /// Service latency summary.
    pub latency: LatencySnapshot,
}

/// The system clock: every CPU's time base plus shared collaborators.
pub struct RtClock {
    cpus: PerCpu<CpuClock>,
    dispatcher: Arc<dyn CalloutDispatcher>,
    publisher: Arc<dyn SnapshotPublisher>,
}

impl RtClock {
    /// Start building a clock.
    pub fn builder() -> RtClockBuilder {
        RtClockBuilder::new()
    }

    /// Number of CPUs.
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// One CPU's clock.
    ///
    /// # Errors
    ///
    /// [`ClockError::CpuOutOfRange`] for an unknown CPU.
    pub fn cpu(&self, cpu: CpuId) -> ClockResult<&CpuClock> {
        self.cpus.get(cpu)
    }

    /// Iterate all CPU clocks.
    pub fn cpus(&self) -> impl Iterator<Item = &CpuClock> + '_ {
        self.cpus.iter().map(|(_, c)| c)
    }

    /// Calibrate `irq.cpu()` and publish its first time base.
    ///
    /// The boot CPU starts at nanotime zero. Other CPUs start from the boot
    /// CPU's current nanotime when it is already calibrated, so all CPUs
    /// share one time line up to counter skew.
    ///
    /// # Errors
    ///
    /// [`ClockError::Calibration`] is fatal for the CPU, which moves to
    /// FAILED. Calibrating twice yields [`ClockError::AlreadyCalibrated`].
    pub fn calibrate(
        &self,
        irq: &IrqDisabled,
        calibrator: &Calibrator,
    ) -> ClockResult<CalibrationConstants> {
        let cpu = irq.cpu();
        let clock = self.cpus.get(cpu)?;
        if clock.state() != ClockState::Uncalibrated {
            return Err(ClockError::AlreadyCalibrated(cpu));
        }

        let constants = match calibrator.compute() {
            Ok(c) => c,
            Err(source) => {
                error!(%cpu, counter_hz = calibrator.counter_hz, %source, "Calibration failed");
                clock.state.transition(ClockState::Failed)?;
                return Err(ClockError::Calibration { cpu, source });
            }
        };
        clock
            .constants
            .set(constants)
            .map_err(|_| ClockError::AlreadyCalibrated(cpu))?;

        let ns_base = if cpu == CpuId::BOOT {
            0
        } else {
            self.cpus
                .get(CpuId::BOOT)
                .ok()
                .filter(|boot| boot.state().is_calibrated())
                .map_or(0, |boot| boot.read().0)
        };
        let base = TimeBase {
            cycle_base: clock.hw.counter.read(),
            ns_base,
            scale: constants.scale_shift.scale,
            shift: constants.scale_shift.shift,
        };
        clock.rebaser(&*self.publisher).commit(irq, base);
        clock.state.transition(ClockState::Calibrated)?;

        info!(
            %cpu,
            counter_hz = constants.counter_hz,
            scale = format_args!("{:#010x}", constants.scale_shift.scale),
            shift = constants.scale_shift.shift,
            exported_hz = constants.speed.frequency_hz,
            max_interval_ns = constants.max_decrementer_interval(),
            min_interval_ns = constants.min_decrementer_interval(),
            ns_base,
            "Calibrated time base"
        );
        Ok(constants)
    }

    /// Begin driving the one-shot timer on `irq.cpu()`.
    ///
    /// Drops any pending deadline and asks the dispatcher to re-evaluate
    /// every queued deadline.
    ///
    /// # Errors
    ///
    /// The CPU must be CALIBRATED.
    pub fn start_ticking(&self, irq: &IrqDisabled) -> ClockResult<()> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.state.transition(ClockState::Ticking)?;
        clock.deadlines.reset(irq);
        self.dispatcher.resync_deadlines(irq);
        info!(cpu = %irq.cpu(), "Timer ticking");
        Ok(())
    }

    /// Arm `irq.cpu()`'s timer for `deadline`; returns the programmed count.
    ///
    /// # Errors
    ///
    /// The CPU must be calibrated.
    pub fn arm(&self, irq: &IrqDisabled, deadline: AbsoluteTime) -> ClockResult<u32> {
        let clock = self.cpus.get(irq.cpu())?;
        let constants = clock.calibrated()?;
        let now = clock.read();
        Ok(clock
            .deadlines
            .arm(irq, now.0, deadline, &constants.timer, &*clock.hw.timer))
    }

    /// Timer interrupt entry for `irq.cpu()`.
    ///
    /// Records the service latency and hands the pop to the dispatcher,
    /// which owns choosing and arming the next deadline.
    ///
    /// # Errors
    ///
    /// The CPU must be calibrated.
    pub fn on_timer_interrupt(
        &self,
        irq: &IrqDisabled,
        frame: InterruptFrame,
    ) -> ClockResult<TimerPop> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.calibrated()?;

        let now = clock.read();
        let pop = clock.deadlines.on_timer_interrupt(irq, now.0, frame);
        if pop.is_early() {
            clock.latency.record_early();
        }
        clock.latency.record(pop.latency_ns);

        self.dispatcher.timer_expired(irq, &pop);
        Ok(pop)
    }

    /// Disarm `irq.cpu()`'s timer ahead of sleep; nothing is pending after.
    ///
    /// # Errors
    ///
    /// [`ClockError::CpuOutOfRange`] for an unknown CPU.
    pub fn suspend(&self, irq: &IrqDisabled) -> ClockResult<()> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.hw.timer.stop();
        clock.deadlines.reset(irq);
        info!(cpu = %irq.cpu(), "Timer stopped for sleep");
        Ok(())
    }

    /// Wake path for `irq.cpu()`, after [`RtClock::on_counter_reset`] has
    /// rebased the record: forget the pending deadline and have the
    /// dispatcher re-arm from its queue.
    ///
    /// # Errors
    ///
    /// The CPU must be calibrated.
    pub fn resume(&self, irq: &IrqDisabled) -> ClockResult<()> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.calibrated()?;
        clock.deadlines.reset(irq);
        self.dispatcher.resync_deadlines(irq);
        info!(cpu = %irq.cpu(), now = clock.read().0, "Timer resumed after wake");
        Ok(())
    }

    /// Deep-idle exit report for `irq.cpu()`.
    ///
    /// # Errors
    ///
    /// The CPU must be calibrated. Stale reports are not errors.
    pub fn on_counter_discontinuity(
        &self,
        irq: &IrqDisabled,
        new_ns_base: u64,
        new_cycle_base: u64,
    ) -> ClockResult<RebaseOutcome> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.calibrated()?;
        Ok(clock
            .rebaser(&*self.publisher)
            .on_counter_discontinuity(irq, new_ns_base, new_cycle_base))
    }

    /// Sleep/wake report for `irq.cpu()`: the counter restarted from zero.
    ///
    /// # Errors
    ///
    /// The CPU must be calibrated.
    pub fn on_counter_reset(&self, irq: &IrqDisabled, new_ns_base: u64) -> ClockResult<TimeBase> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.calibrated()?;
        Ok(clock
            .rebaser(&*self.publisher)
            .on_counter_reset(irq, new_ns_base))
    }

    /// Counter frequency change on `irq.cpu()`.
    ///
    /// # Errors
    ///
    /// Always fails; stepping is unsupported.
    pub fn on_frequency_step(&self, irq: &IrqDisabled, old_hz: u64, new_hz: u64) -> ClockResult<()> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.rebaser(&*self.publisher).on_frequency_step(old_hz, new_hz)
    }

    /// Push `irq.cpu()`'s current time base to the publisher again, for a
    /// consumer that attached after calibration.
    ///
    /// # Errors
    ///
    /// The CPU must be calibrated.
    pub fn republish(&self, irq: &IrqDisabled) -> ClockResult<()> {
        let clock = self.cpus.get(irq.cpu())?;
        clock.calibrated()?;
        self.publisher.publish(crate::publish::TimeSnapshot::from_base(
            clock.cpu,
            clock.record.snapshot(),
            clock.record.generation(),
        ));
        Ok(())
    }

    /// Current absolute time on `cpu`.
    ///
    /// # Errors
    ///
    /// Unknown or uncalibrated CPU.
    pub fn now(&self, cpu: CpuId) -> ClockResult<AbsoluteTime> {
        let clock = self.cpus.get(cpu)?;
        clock.calibrated()?;
        Ok(clock.read())
    }

    /// Current time on `cpu` as seconds and microseconds.
    ///
    /// # Errors
    ///
    /// Unknown or uncalibrated CPU.
    pub fn system_microtime(&self, cpu: CpuId) -> ClockResult<SecsMicros> {
        self.now(cpu).map(absolutetime_to_microtime)
    }

    /// Current time on `cpu` as seconds and nanoseconds.
    ///
    /// # Errors
    ///
    /// Unknown or uncalibrated CPU.
    pub fn system_nanotime(&self, cpu: CpuId) -> ClockResult<SecsNanos> {
        self.now(cpu).map(absolutetime_to_nanotime)
    }

    /// Busy-wait on `cpu` until its clock reaches `deadline`.
    ///
    /// Reads the clock at least once; returns the first reading at or past
    /// the deadline.
    ///
    /// # Errors
    ///
    /// Unknown or uncalibrated CPU.
    pub fn delay_until(&self, cpu: CpuId, deadline: AbsoluteTime) -> ClockResult<AbsoluteTime> {
        let clock = self.cpus.get(cpu)?;
        clock.calibrated()?;
        loop {
            let now = clock.read();
            if now >= deadline {
                return Ok(now);
            }
            std::hint::spin_loop();
        }
    }

    /// Diagnostics for every CPU.
    pub fn reports(&self) -> Vec<CpuReport> {
        self.cpus().map(CpuClock::report).collect()
    }
}

/// Builder for [`RtClock`].
pub struct RtClockBuilder {
    cpus: Vec<CpuHardware>,
    dispatcher: Option<Arc<dyn CalloutDispatcher>>,
    publisher: Option<Arc<dyn SnapshotPublisher>>,
    histogram_size: usize,
}

impl Default for RtClockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RtClockBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            cpus: Vec::new(),
            dispatcher: None,
            publisher: None,
            histogram_size: DEFAULT_HISTOGRAM_SIZE,
        }
    }

    /// Add the next CPU (CPU 0 first).
    pub fn cpu(mut self, counter: Arc<dyn CycleCounter>, timer: Arc<dyn OneShotTimer>) -> Self {
        self.cpus.push(CpuHardware::new(counter, timer));
        self
    }

    /// Add several CPUs at once.
    pub fn cpus(mut self, hardware: impl IntoIterator<Item = CpuHardware>) -> Self {
        self.cpus.extend(hardware);
        self
    }

    /// Set the callout dispatcher.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn CalloutDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the snapshot publisher.
    pub fn publisher(mut self, publisher: Arc<dyn SnapshotPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Set the per-CPU latency history length.
    pub fn histogram_size(mut self, size: usize) -> Self {
        self.histogram_size = size;
        self
    }

    /// Build the clock with every CPU UNCALIBRATED.
    ///
    /// # Errors
    ///
    /// [`ClockError::Config`] if no CPUs, dispatcher or publisher were given.
    pub fn build(self) -> ClockResult<RtClock> {
        if self.cpus.is_empty() {
            return Err(ClockError::Config("no CPUs configured".into()));
        }
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| ClockError::Config("no callout dispatcher".into()))?;
        let publisher = self
            .publisher
            .ok_or_else(|| ClockError::Config("no snapshot publisher".into()))?;

        let histogram_size = self.histogram_size;
        let clocks = self
            .cpus
            .into_iter()
            .enumerate()
            .map(|(i, hw)| CpuClock::new(CpuId(i), hw, histogram_size))
            .collect();

        Ok(RtClock {
            cpus: PerCpu::from_vec(clocks),
            dispatcher,
            publisher,
        })
    }
}

static_assertions::assert_impl_all!(RtClock: Send, Sync);
