//! rtclockd entry point.
//!
//! Boots the nanotime engine on simulated CPUs backed by the host
//! monotonic clock, runs the configured workload and prints a report.

mod diagnostics;
mod signals;
mod simulation;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rtclock_common::config::ClockConfig;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::diagnostics::{format_prometheus_metrics, RunReport};
use crate::signals::ShutdownFlag;
use crate::simulation::Simulation;

/// rtclockd command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "rtclockd",
    about = "Per-CPU nanotime engine driven by simulated hardware",
    version,
    long_about = None
)]
struct Args {
    /// Path to a clock configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of simulated CPUs (overrides config file).
    #[arg(long)]
    cpus: Option<usize>,

    /// Ticks each CPU runs (overrides config file).
    #[arg(long)]
    ticks: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rtclockd");

    let mut config = load_config(&args)?;
    if let Some(cpus) = args.cpus {
        config.cpus = cpus;
    }
    if let Some(ticks) = args.ticks {
        config.simulation.ticks = ticks;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        cpus = config.cpus,
        counter_hz = config.counter.frequency_hz,
        timer_hz = config.timer.frequency_hz,
        ticks = config.simulation.ticks,
        "Configuration loaded"
    );

    let shutdown = ShutdownFlag::install().context("Failed to set up signal handlers")?;
    let report = run(config, &shutdown)?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print!("{}", format_prometheus_metrics(&report));
    }

    info!(
        health = %report.health,
        reads = report.readers.reads,
        violations = report.readers.violations,
        signals = shutdown.signal_count(),
        elapsed_ms = report.elapsed.as_millis(),
        "rtclockd finished"
    );

    if report.is_failure() {
        bail!(
            "run unhealthy: {} monotonicity violations, {} failed CPUs",
            report.readers.violations,
            report.failed_cpus.len()
        );
    }
    Ok(())
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("rtclockd={level},rtclock_core={level},rtclock_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `RTCLOCK_CONFIG_PATH` environment variable
/// 3. `/etc/rtclock/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<ClockConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return ClockConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("RTCLOCK_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from RTCLOCK_CONFIG_PATH");
            return ClockConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from RTCLOCK_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "RTCLOCK_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/rtclock/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config");
            return ClockConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(ClockConfig::default())
}

fn run(config: ClockConfig, shutdown: &ShutdownFlag) -> Result<RunReport> {
    let sim = Simulation::new(config).context("Failed to set up simulation")?;
    let outcome = sim.run(shutdown).context("Workload failed")?;
    if outcome.interrupted {
        warn!("Workload interrupted by signal");
    }
    Ok(RunReport::collect(&sim, &outcome))
}
