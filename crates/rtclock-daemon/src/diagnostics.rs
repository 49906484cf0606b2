//! End-of-run diagnostics for the daemon.
//!
//! Gathers per-CPU engine reports and workload statistics into a
//! [`RunReport`], rendered either as JSON or in Prometheus text exposition
//! format.

use crate::simulation::{ReaderStats, RunOutcome, Simulation, WorkerStats};
use rtclock_common::cpu::CpuId;
use rtclock_common::state::ClockState;
use rtclock_core::clock::CpuReport;
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every CPU calibrated and every read was monotonic.
    Healthy,
    /// Timer pops arrived early, or the run was cut short.
    Degraded,
    /// A clock went backwards or a CPU failed calibration.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One CPU's share of the report.
#[derive(Debug, Clone, Serialize)]
pub struct CpuSummary {
    /// Engine-side view.
    #[serde(flatten)]
    pub engine: CpuReport,
    /// Workload-side view; absent for CPUs that never ran.
    pub workload: Option<WorkerStats>,
    /// Pops the dispatcher received.
    pub dispatched: u64,
    /// Deadline resync requests.
    pub resyncs: u64,
    /// Configured latency percentiles, `(percentile, ns)`.
    pub latency_percentiles: Vec<(f64, u64)>,
}

/// The complete report.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Verdict.
    pub health: HealthStatus,
    /// Stopped by a signal before the workload finished.
    pub interrupted: bool,
    /// Workload wall time.
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Per-CPU summaries.
    pub cpus: Vec<CpuSummary>,
    /// Reader thread totals.
    pub readers: ReaderStats,
    /// CPUs that failed calibration.
    pub failed_cpus: Vec<CpuId>,
    /// Published snapshot updates.
    pub publications: u64,
    /// Worst late-pop latency across CPUs.
    pub worst_latency_ns: u64,
}

impl RunReport {
    /// Assemble the report for a finished run.
    pub fn collect(sim: &Simulation, outcome: &RunOutcome) -> Self {
        let percentiles = &sim.config().metrics.percentiles;
        let cpus: Vec<CpuSummary> = sim
            .clock()
            .cpus()
            .map(|clock| {
                let cpu = clock.cpu();
                CpuSummary {
                    engine: clock.report(),
                    workload: outcome.workers.iter().find(|w| w.cpu == cpu).copied(),
                    dispatched: sim.dispatcher().pops(cpu),
                    resyncs: sim.dispatcher().resyncs(cpu),
                    latency_percentiles: clock
                        .latency()
                        .percentiles(percentiles)
                        .into_iter()
                        .map(|(p, d)| (p, u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)))
                        .collect(),
                }
            })
            .collect();

        let mut report = Self {
            health: HealthStatus::Healthy,
            interrupted: outcome.interrupted,
            elapsed: outcome.elapsed,
            cpus,
            readers: outcome.readers,
            failed_cpus: outcome.failed_cpus.clone(),
            publications: sim.published().publications(),
            worst_latency_ns: sim.dispatcher().worst_latency_ns(),
        };
        report.health = report.assess();
        report
    }

    fn assess(&self) -> HealthStatus {
        let failed = self
            .cpus
            .iter()
            .any(|c| c.engine.state == ClockState::Failed);
        if self.readers.violations > 0 || failed || !self.failed_cpus.is_empty() {
            return HealthStatus::Unhealthy;
        }
        let early = self.cpus.iter().any(|c| c.engine.latency.early_count > 0);
        if early || self.interrupted {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Whether the daemon should exit with failure.
    pub fn is_failure(&self) -> bool {
        self.health == HealthStatus::Unhealthy
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Render `report` in Prometheus text exposition format.
pub fn format_prometheus_metrics(report: &RunReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP rtclock_health Run verdict (1=healthy, 0=not healthy)");
    let _ = writeln!(out, "# TYPE rtclock_health gauge");
    let _ = writeln!(
        out,
        "rtclock_health{{status=\"{}\"}} {}",
        report.health,
        u8::from(report.health == HealthStatus::Healthy)
    );

    let _ = writeln!(out, "# HELP rtclock_reads_total Clock reads by reader threads");
    let _ = writeln!(out, "# TYPE rtclock_reads_total counter");
    let _ = writeln!(out, "rtclock_reads_total {}", report.readers.reads);

    let _ = writeln!(
        out,
        "# HELP rtclock_monotonicity_violations_total Reads that went backwards"
    );
    let _ = writeln!(out, "# TYPE rtclock_monotonicity_violations_total counter");
    let _ = writeln!(
        out,
        "rtclock_monotonicity_violations_total {}",
        report.readers.violations
    );

    let _ = writeln!(out, "# HELP rtclock_publications_total Published snapshot updates");
    let _ = writeln!(out, "# TYPE rtclock_publications_total counter");
    let _ = writeln!(out, "rtclock_publications_total {}", report.publications);

    let _ = writeln!(out, "# HELP rtclock_state Per-CPU lifecycle state");
    let _ = writeln!(out, "# TYPE rtclock_state gauge");
    for c in &report.cpus {
        let _ = writeln!(
            out,
            "rtclock_state{{cpu=\"{}\",state=\"{}\"}} 1",
            c.engine.cpu.index(),
            c.engine.state
        );
    }

    let _ = writeln!(out, "# HELP rtclock_timer_pops_total Serviced timer interrupts");
    let _ = writeln!(out, "# TYPE rtclock_timer_pops_total counter");
    for c in &report.cpus {
        let _ = writeln!(
            out,
            "rtclock_timer_pops_total{{cpu=\"{}\"}} {}",
            c.engine.cpu.index(),
            c.engine.pops
        );
    }

    let _ = writeln!(out, "# HELP rtclock_early_pops_total Timer interrupts before their deadline");
    let _ = writeln!(out, "# TYPE rtclock_early_pops_total counter");
    for c in &report.cpus {
        let _ = writeln!(
            out,
            "rtclock_early_pops_total{{cpu=\"{}\"}} {}",
            c.engine.cpu.index(),
            c.engine.latency.early_count
        );
    }

    let _ = writeln!(out, "# HELP rtclock_rebases_total Deep-idle discontinuity reports");
    let _ = writeln!(out, "# TYPE rtclock_rebases_total counter");
    for c in &report.cpus {
        if let Some(w) = &c.workload {
            let cpu = c.engine.cpu.index();
            let _ = writeln!(
                out,
                "rtclock_rebases_total{{cpu=\"{cpu}\",outcome=\"adopted\"}} {}",
                w.rebases_adopted
            );
            let _ = writeln!(
                out,
                "rtclock_rebases_total{{cpu=\"{cpu}\",outcome=\"rejected\"}} {}",
                w.rebases_rejected
            );
        }
    }

    let _ = writeln!(out, "# HELP rtclock_pop_latency_seconds Timer interrupt service latency");
    let _ = writeln!(out, "# TYPE rtclock_pop_latency_seconds summary");
    for c in &report.cpus {
        let cpu = c.engine.cpu.index();
        for (p, ns) in &c.latency_percentiles {
            let _ = writeln!(
                out,
                "rtclock_pop_latency_seconds{{cpu=\"{cpu}\",quantile=\"{}\"}} {:.9}",
                p / 100.0,
                Duration::from_nanos(*ns).as_secs_f64()
            );
        }
        let _ = writeln!(
            out,
            "rtclock_pop_latency_seconds_count{{cpu=\"{cpu}\"}} {}",
            c.engine.latency.total
        );
    }

    let _ = writeln!(out, "# HELP rtclock_run_seconds Workload wall time");
    let _ = writeln!(out, "# TYPE rtclock_run_seconds gauge");
    let _ = writeln!(out, "rtclock_run_seconds {:.3}", report.elapsed.as_secs_f64());

    out
}
