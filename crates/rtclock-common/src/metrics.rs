//! Timer-interrupt service latency metrics.
//!
//! Provides a ring buffer-based histogram for tracking how late each timer
//! pop was serviced relative to its armed deadline, without heap
//! allocations or locks on the recording path.
//!
//! Each histogram has a single writer (the interrupt handler of the owning
//! CPU). Readers on other CPUs may observe a sample count and a sum from
//! slightly different moments; the figures are diagnostics, not invariants.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Interrupt latency metrics with an atomic ring buffer.
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Ring buffer of latencies in nanoseconds.
    samples: Box<[AtomicU64]>,
    /// Current write position in the ring buffer.
    write_pos: AtomicUsize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: AtomicUsize,
    /// Total pops recorded.
    total: AtomicU64,
    /// Pops that arrived before their deadline.
    early_count: AtomicU64,
    /// Minimum observed latency in nanoseconds.
    min_ns: AtomicU64,
    /// Maximum observed latency in nanoseconds.
    max_ns: AtomicU64,
    /// Sum of all latencies for mean calculation.
    sum_ns: AtomicU64,
}

impl LatencyHistogram {
    /// Create a new histogram retaining `histogram_size` samples.
    #[must_use]
    pub fn new(histogram_size: usize) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: (0..size).map(|_| AtomicU64::new(0)).collect(),
            write_pos: AtomicUsize::new(0),
            sample_count: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            early_count: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
        }
    }

    /// Record a service latency in nanoseconds.
    ///
    /// Must only be called by the owning CPU.
    pub fn record(&self, ns: u64) {
        let pos = self.write_pos.load(Ordering::Relaxed);
        self.samples[pos].store(ns, Ordering::Relaxed);
        self.write_pos
            .store((pos + 1) % self.samples.len(), Ordering::Relaxed);
        let count = self.sample_count.load(Ordering::Relaxed);
        if count < self.samples.len() {
            self.sample_count.store(count + 1, Ordering::Release);
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Count a pop that fired before its deadline.
    pub fn record_early(&self) {
        self.early_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total pops recorded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Pops that arrived before their deadline.
    #[must_use]
    pub fn early_count(&self) -> u64 {
        self.early_count.load(Ordering::Relaxed)
    }

    /// Minimum observed latency.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.total() > 0).then(|| Duration::from_nanos(self.min_ns.load(Ordering::Relaxed)))
    }

    /// Maximum observed latency.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total() > 0).then(|| Duration::from_nanos(self.max_ns.load(Ordering::Relaxed)))
    }

    /// Mean latency.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        let total = self.total();
        (total > 0).then(|| Duration::from_nanos(self.sum_ns.load(Ordering::Relaxed) / total))
    }

    fn sorted_samples(&self) -> Vec<u64> {
        let count = self.sample_count.load(Ordering::Acquire);
        let mut sorted: Vec<u64> = self.samples[..count]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect();
        sorted.sort_unstable();
        sorted
    }

    /// Compute a percentile (0.0 to 100.0) from the ring buffer.
    ///
    /// Returns `None` if no samples have been collected or if percentile is out of range.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if !(0.0..=100.0).contains(&percentile) {
            return None;
        }
        let sorted = self.sorted_samples();
        if sorted.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(sorted[rank(percentile, sorted.len())]))
    }

    /// Compute multiple percentiles with one sort.
    ///
    /// Invalid percentiles (< 0, > 100, or NaN) are skipped.
    #[must_use]
    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<(f64, Duration)> {
        let sorted = self.sorted_samples();
        if sorted.is_empty() {
            return vec![];
        }

        percentiles
            .iter()
            .filter(|p| (0.0..=100.0).contains(*p))
            .map(|&p| (p, Duration::from_nanos(sorted[rank(p, sorted.len())])))
            .collect()
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> LatencySnapshot {
        let total = self.total();
        let has = total > 0;
        LatencySnapshot {
            total,
            early_count: self.early_count(),
            min_ns: has.then(|| self.min_ns.load(Ordering::Relaxed)),
            max_ns: has.then(|| self.max_ns.load(Ordering::Relaxed)),
            mean_ns: has.then(|| self.sum_ns.load(Ordering::Relaxed) / total),
            sample_count: self.sample_count.load(Ordering::Acquire),
        }
    }

    /// Reset all metrics to initial state. Owning CPU only.
    pub fn reset(&self) {
        for s in self.samples.iter() {
            s.store(0, Ordering::Relaxed);
        }
        self.write_pos.store(0, Ordering::Relaxed);
        self.sample_count.store(0, Ordering::Release);
        self.total.store(0, Ordering::Relaxed);
        self.early_count.store(0, Ordering::Relaxed);
        self.min_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
        self.sum_ns.store(0, Ordering::Relaxed);
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn rank(percentile: f64, len: usize) -> usize {
    let idx = ((percentile / 100.0) * (len - 1) as f64).round() as usize;
    idx.min(len - 1)
}

/// Immutable snapshot of latency metrics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    /// Total pops recorded.
    pub total: u64,
    /// Pops that arrived before their deadline.
    pub early_count: u64,
    /// Minimum latency in nanoseconds.
    pub min_ns: Option<u64>,
    /// Maximum latency in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean latency in nanoseconds.
    pub mean_ns: Option<u64>,
    /// Number of samples in the histogram.
    pub sample_count: usize,
}

impl LatencySnapshot {
    /// Get jitter (max - min) in nanoseconds.
    #[must_use]
    pub fn jitter_ns(&self) -> Option<u64> {
        match (self.min_ns, self.max_ns) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}
