//! Fixed-size per-CPU table.
//!
//! Each slot sits on its own cache line so one CPU's writes never
//! invalidate another CPU's record.

use crossbeam_utils::CachePadded;
use rtclock_common::cpu::CpuId;
use rtclock_common::error::{ClockError, ClockResult};

/// One `T` per logical CPU, indexed by [`CpuId`].
#[derive(Debug)]
pub struct PerCpu<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T> PerCpu<T> {
    /// Build a table of `count` slots, initializing each from its CPU id.
    pub fn new(count: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        Self {
            slots: (0..count)
                .map(|i| CachePadded::new(init(CpuId(i))))
                .collect(),
        }
    }

    /// Build a table from already constructed values, CPU 0 first.
    pub fn from_vec(values: Vec<T>) -> Self {
        Self {
            slots: values.into_iter().map(CachePadded::new).collect(),
        }
    }

    /// Number of CPUs.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no CPUs.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot for `cpu`.
    ///
    /// # Errors
    ///
    /// [`ClockError::CpuOutOfRange`] if `cpu` is past the end of the table.
    #[inline]
    pub fn get(&self, cpu: CpuId) -> ClockResult<&T> {
        self.slots
            .get(cpu.index())
            .map(|slot| &**slot)
            .ok_or(ClockError::CpuOutOfRange {
                cpu,
                count: self.slots.len(),
            })
    }

    /// Iterate `(cpu, slot)` pairs in CPU order.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (CpuId(i), &**slot))
    }
}
