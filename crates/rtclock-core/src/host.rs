//! Host-backed hardware for running the engine as a user-space process.
//!
//! - [`HostCounter`]: the host's raw monotonic clock scaled to a nominal
//!   cycle frequency, with pause/resume/reset to emulate deep idle and sleep
//! - [`host_nanos`]: an independent reference clock, standing in for the
//!   platform timer power management measures new bases with
//! - [`pin_current_thread`]: CPU affinity so a simulated CPU stays on one
//!   host CPU

#![allow(unused_imports)] // Platform-specific code may not use all imports

use crate::hal::CycleCounter;
use crate::seqlock::SeqLock;
use nix::time::{clock_gettime, ClockId};
use rtclock_common::cpu::CpuId;
use rtclock_common::error::{ClockError, ClockResult};
use rtclock_common::time::NSEC_PER_SEC;
use tracing::{debug, info, warn};

#[cfg(any(target_os = "linux", target_os = "android"))]
const HOST_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC_RAW;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const HOST_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC;

fn read_host_clock() -> nix::Result<u64> {
    let ts = clock_gettime(HOST_CLOCK)?;
    let secs = u64::try_from(ts.tv_sec()).unwrap_or(0);
    let nanos = u64::try_from(ts.tv_nsec()).unwrap_or(0);
    Ok(secs.saturating_mul(NSEC_PER_SEC).saturating_add(nanos))
}

/// Host monotonic time in nanoseconds.
///
/// Returns 0 if the host clock is unavailable, which [`HostCounter::new`]
/// rules out up front.
pub fn host_nanos() -> u64 {
    read_host_clock().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default)]
struct CounterState {
    /// Host cycles subtracted from every reading.
    offset: u64,
    /// Value held while the counter is stopped.
    frozen: Option<u64>,
}

/// Cycle counter derived from the host clock.
#[derive(Debug)]
pub struct HostCounter {
    frequency_hz: u64,
    state: SeqLock<CounterState>,
}

impl HostCounter {
    /// Counter ticking at `frequency_hz`, starting from zero now.
    ///
    /// # Errors
    ///
    /// [`ClockError::Config`] if the host clock cannot be read or the
    /// frequency is zero.
    pub fn new(frequency_hz: u64) -> ClockResult<Self> {
        if frequency_hz == 0 {
            return Err(ClockError::Config("host counter frequency is zero".into()));
        }
        let now = read_host_clock()
            .map_err(|e| ClockError::Config(format!("host clock unavailable: {e}")))?;
        Ok(Self {
            frequency_hz,
            state: SeqLock::new(CounterState {
                offset: Self::scale(now, frequency_hz),
                frozen: None,
            }),
        })
    }

    /// Nominal frequency.
    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    #[allow(clippy::cast_possible_truncation)]
    fn scale(ns: u64, hz: u64) -> u64 {
        (u128::from(ns) * u128::from(hz) / u128::from(NSEC_PER_SEC)) as u64
    }

    fn host_cycles(&self) -> u64 {
        Self::scale(host_nanos(), self.frequency_hz)
    }

    /// Stop the counter at its current value.
    ///
    /// The host clock is sampled while the write side is held, so no reader
    /// can have observed a later value than the one frozen.
    pub fn pause(&self) {
        self.state.write(|s| {
            if s.frozen.is_none() {
                s.frozen = Some(self.host_cycles().saturating_sub(s.offset));
            }
        });
    }

    /// Restart a paused counter from the value it stopped at.
    pub fn resume(&self) {
        self.state.write(|s| {
            if let Some(frozen) = s.frozen.take() {
                s.offset = self.host_cycles().saturating_sub(frozen);
            }
        });
    }

    /// Restart from zero, running.
    pub fn reset(&self) {
        let host = self.host_cycles();
        self.state.store(CounterState {
            offset: host,
            frozen: None,
        });
    }

    /// Whether the counter is stopped.
    pub fn is_paused(&self) -> bool {
        self.state.read().frozen.is_some()
    }
}

impl CycleCounter for HostCounter {
    fn read(&self) -> u64 {
        self.state.read_with(|s| match s.frozen {
            Some(value) => value,
            None => self.host_cycles().saturating_sub(s.offset),
        })
    }
}

/// Pin the calling thread to the host CPU with the same index as `cpu`.
///
/// Returns `Ok(false)` when the host has no such CPU or the platform has
/// no affinity control; the simulation still runs, only less faithfully.
///
/// # Errors
///
/// [`ClockError::Config`] for any other affinity failure.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: CpuId) -> ClockResult<bool> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    if let Err(e) = cpu_set.set(cpu.index()) {
        warn!(%cpu, error = %e, "CPU index exceeds the host affinity mask");
        return Ok(false);
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            debug!(%cpu, "Pinned worker thread");
            Ok(true)
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(%cpu, "Host CPU does not exist - running unpinned");
            Ok(false)
        }
        Err(e) => Err(ClockError::Config(format!("sched_setaffinity failed: {e}"))),
    }
}

/// Affinity is unavailable here; always `Ok(false)`.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: CpuId) -> ClockResult<bool> {
    info!(%cpu, "CPU affinity not available on this platform");
    Ok(false)
}
