//! Published time snapshot for low-overhead consumers.
//!
//! Whenever a CPU's time base is calibrated or rebased, a copy of its
//! fields is pushed to a [`SnapshotPublisher`]. Consumers such as a
//! user-space fast path apply the same extrapolation against their own
//! counter read.

use crate::timebase::TimeBase;
use crate::seqlock::SeqLock;
use rtclock_common::cpu::CpuId;
use serde::Serialize;

/// Opaque copy of a time base as published to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeSnapshot {
    /// Counter value at which `ns_base` was true.
    pub cycle_base: u64,
    /// Nanoseconds since epoch at `cycle_base`.
    pub ns_base: u64,
    /// Q32.32 nanoseconds per cycle.
    pub scale: u32,
    /// Read mode selector.
    pub shift: u32,
    /// CPU whose record produced this snapshot.
    pub cpu: CpuId,
    /// Record generation at publication.
    pub generation: u64,
}

impl TimeSnapshot {
    /// Snapshot of `base` taken from `cpu`'s record at `generation`.
    #[must_use]
    pub const fn from_base(cpu: CpuId, base: TimeBase, generation: u64) -> Self {
        Self {
            cycle_base: base.cycle_base,
            ns_base: base.ns_base,
            scale: base.scale,
            shift: base.shift,
            cpu,
            generation,
        }
    }

    /// The time base fields alone.
    #[must_use]
    pub const fn time_base(&self) -> TimeBase {
        TimeBase {
            cycle_base: self.cycle_base,
            ns_base: self.ns_base,
            scale: self.scale,
            shift: self.shift,
        }
    }
}

/// Sink for re-published time bases.
pub trait SnapshotPublisher: Send + Sync {
    /// Replace the published snapshot.
    fn publish(&self, snapshot: TimeSnapshot);
}

/// Atomically replaceable snapshot, readable without locks.
#[derive(Debug, Default)]
pub struct PublishedTime {
    current: SeqLock<TimeSnapshot>,
}

impl PublishedTime {
    /// Empty snapshot (all zero).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> TimeSnapshot {
        self.current.read()
    }

    /// Nanotime a consumer would compute at counter value `counter`.
    pub fn now(&self, counter: u64) -> u64 {
        self.snapshot().time_base().nanotime_at(counter)
    }

    /// Number of publications so far.
    pub fn publications(&self) -> u64 {
        self.current.generation() / 2
    }
}

impl SnapshotPublisher for PublishedTime {
    fn publish(&self, snapshot: TimeSnapshot) {
        self.current.store(snapshot);
    }
}
