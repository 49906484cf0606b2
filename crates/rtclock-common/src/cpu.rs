use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical CPU identifier, used to index per-CPU state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct CpuId(pub usize);

impl CpuId {
    /// The CPU that boots first and owns process-wide one-time setup.
    pub const BOOT: CpuId = CpuId(0);

    /// Index into a per-CPU table.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl From<usize> for CpuId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}
