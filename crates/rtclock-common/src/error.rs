use crate::cpu::CpuId;
use thiserror::Error;

/// Reasons a boot-time calibration can fail.
///
/// Every variant is fatal for the CPU being calibrated: there is no
/// degraded mode and no retry.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationError {
    /// The platform reported a cycle counter frequency of zero.
    #[error("cycle counter frequency is zero")]
    ZeroFrequency,

    /// The counter runs too slowly to be a usable time source.
    #[error("cycle counter frequency {hz} Hz is below the {min_hz} Hz minimum")]
    FrequencyTooLow {
        /// Measured frequency.
        hz: u64,
        /// Smallest accepted frequency.
        min_hz: u64,
    },

    /// The one-shot timer tick frequency is zero.
    #[error("hardware timer frequency is zero")]
    ZeroTimerFrequency,

    /// The timer's maximum count register value cannot hold a single tick.
    #[error("hardware timer max count is zero")]
    ZeroTimerRange,
}

/// Clock error types covering calibration, lifecycle misuse, and table lookups.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClockError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Boot-time calibration failed; the CPU cannot keep time.
    #[error("calibration failed on {cpu}: {source}")]
    Calibration {
        /// CPU whose calibration failed.
        cpu: CpuId,
        /// Underlying failure.
        #[source]
        source: CalibrationError,
    },

    /// CPU index outside the per-CPU table.
    #[error("{cpu} is out of range (table holds {count} CPUs)")]
    CpuOutOfRange {
        /// Requested CPU.
        cpu: CpuId,
        /// Number of CPUs in the table.
        count: usize,
    },

    /// The CPU has not been calibrated yet.
    #[error("{0} has not been calibrated")]
    NotCalibrated(CpuId),

    /// The CPU was already calibrated; calibration runs once per boot.
    #[error("{0} is already calibrated")]
    AlreadyCalibrated(CpuId),

    /// Counter frequency stepping is not supported by this time base.
    #[error("frequency stepping from {old_hz} Hz to {new_hz} Hz is unsupported")]
    FrequencyStepUnsupported {
        /// Frequency before the step.
        old_hz: u64,
        /// Frequency after the step.
        new_hz: u64,
    },

    /// Invalid lifecycle transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Convenience type alias for clock operations.
pub type ClockResult<T> = Result<T, ClockError>;
