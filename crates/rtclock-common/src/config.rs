//! Configuration structures for the clock engine and its simulation daemon.
//!
//! Supports TOML deserialization with defaults that describe a plausible
//! x86 machine: a 2.4 GHz invariant cycle counter and a 100 MHz one-shot
//! timer with a 31-bit count register.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest CPU table the daemon will build.
pub const MAX_CPUS: usize = 256;

/// Top-level clock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Number of logical CPUs to bring up.
    pub cpus: usize,

    /// Cycle counter parameters.
    pub counter: CounterConfig,

    /// One-shot timer parameters.
    pub timer: TimerConfig,

    /// Interrupt-latency metrics.
    pub metrics: MetricsConfig,

    /// Workload driven by `rtclockd`.
    pub simulation: SimulationConfig,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            counter: CounterConfig::default(),
            timer: TimerConfig::default(),
            metrics: MetricsConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// Cycle counter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Nominal counter frequency in Hz, as the platform would report it.
    pub frequency_hz: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 2_400_000_000,
        }
    }
}

/// One-shot hardware timer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Timer tick frequency in Hz.
    pub frequency_hz: u64,

    /// Largest value the count register accepts.
    pub max_count: u32,

    /// Floor for any armed interval.
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100_000_000,
            max_count: 0x7fff_ffff,
            min_interval: Duration::from_micros(1),
        }
    }
}

/// Metrics and diagnostics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Size of the per-CPU latency histogram ring buffer.
    pub histogram_size: usize,

    /// Percentiles to report (e.g., [50, 90, 99, 99.9]).
    pub percentiles: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_size: 10_000,
            percentiles: vec![50.0, 90.0, 99.0, 99.9],
        }
    }
}

/// Simulated workload for the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Timer pops to deliver per CPU.
    pub ticks: u64,

    /// Distance between successive deadlines.
    #[serde(with = "humantime_serde")]
    pub tick_period: Duration,

    /// Report a deep-idle discontinuity every N ticks (0 disables).
    pub idle_every: u64,

    /// How long the counter stays stopped during deep idle.
    #[serde(with = "humantime_serde")]
    pub idle_duration: Duration,

    /// Tick at which CPU 0 goes through a sleep/wake cycle.
    pub sleep_at_tick: Option<u64>,

    /// Time spent asleep.
    #[serde(with = "humantime_serde")]
    pub sleep_duration: Duration,

    /// Threads continuously reading every CPU's clock.
    pub reader_threads: usize,

    /// Pin each CPU worker to the host CPU of the same index.
    pub pin_threads: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ticks: 1_000,
            tick_period: Duration::from_millis(1),
            idle_every: 100,
            idle_duration: Duration::from_millis(5),
            sleep_at_tick: Some(500),
            sleep_duration: Duration::from_millis(50),
            reader_threads: 2,
            pin_threads: false,
        }
    }
}

impl ClockConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values that parse but cannot describe working hardware.
    ///
    /// Counter frequencies that are non-zero but too slow are left to
    /// calibration, which owns that threshold.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::Validation(format!(
                "cpus must be between 1 and {MAX_CPUS}, got {}",
                self.cpus
            )));
        }
        if self.counter.frequency_hz == 0 {
            return Err(ConfigError::Validation(
                "counter.frequency_hz must be non-zero".into(),
            ));
        }
        if self.timer.frequency_hz == 0 {
            return Err(ConfigError::Validation(
                "timer.frequency_hz must be non-zero".into(),
            ));
        }
        if self.timer.max_count == 0 {
            return Err(ConfigError::Validation(
                "timer.max_count must be non-zero".into(),
            ));
        }
        if self.metrics.histogram_size == 0 {
            return Err(ConfigError::Validation(
                "metrics.histogram_size must be non-zero".into(),
            ));
        }
        if let Some(p) = self
            .metrics
            .percentiles
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(ConfigError::Validation(format!(
                "metrics.percentiles entry {p} is outside 0..=100"
            )));
        }
        if self.simulation.tick_period.is_zero() {
            return Err(ConfigError::Validation(
                "simulation.tick_period must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid value.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
