//! Orchestrator Metrics
//!
//! Lock-free counters, a running gauge with high-water mark, and a latency
//! histogram. Everything here is safe to update from any worker without
//! coordination.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket boundaries (in the unit being measured)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Create with default latency buckets (in milliseconds)
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value_u64 = value as u64;
        self.sum.fetch_add(value_u64, Ordering::Relaxed);
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Get histogram snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Upper bucket boundaries
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Samples recorded
    pub total: u64,
    /// Sum of samples
    pub sum: u64,
    /// Smallest sample
    pub min: u64,
    /// Largest sample
    pub max: u64,
    /// Mean sample
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket containing the p-th percentile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Get p50
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// Get p90
    pub fn p90(&self) -> f64 {
        self.percentile(0.9)
    }

    /// Get p99
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that remembers its high-water mark
#[derive(Debug, Default)]
pub struct PeakGauge {
    value: AtomicU64,
    peak: AtomicU64,
}

impl PeakGauge {
    /// Increment, returning the new value
    pub fn inc(&self) -> u64 {
        let now = self.value.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        now
    }

    /// Decrement
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Highest value observed
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }
}

// ============================================================================
// Orchestrator Metrics
// ============================================================================

/// Counters for the whole orchestrator
#[derive(Debug)]
pub struct OrchestratorMetrics {
    /// Tasks accepted into the queue
    pub submitted: Counter,
    /// Submissions rejected (queue full, deadline, shutdown)
    pub rejected: Counter,
    /// Tasks completed with every provider succeeding
    pub completed: Counter,
    /// Tasks completed with some providers failing
    pub partial: Counter,
    /// Tasks that produced no output
    pub failed: Counter,
    /// Tasks abandoned at their deadline
    pub timed_out: Counter,
    /// Tasks cancelled
    pub cancelled: Counter,
    /// Provider calls retried after a transient failure
    pub retries: Counter,
    /// Times a single-mode task moved on to the next provider
    pub fallbacks: Counter,
    /// Provider calls made
    pub provider_calls: Counter,
    /// Tasks currently running
    pub running: PeakGauge,
    /// Submission to terminal state, in milliseconds
    pub task_latency: Histogram,
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self {
            submitted: Counter::default(),
            rejected: Counter::default(),
            completed: Counter::default(),
            partial: Counter::default(),
            failed: Counter::default(),
            timed_out: Counter::default(),
            cancelled: Counter::default(),
            retries: Counter::default(),
            fallbacks: Counter::default(),
            provider_calls: Counter::default(),
            running: PeakGauge::default(),
            task_latency: Histogram::latency_default(),
        }
    }
}

impl OrchestratorMetrics {
    /// Point-in-time copy
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.task_latency.snapshot();
        let completed = self.completed.get();
        let partial = self.partial.get();
        let finished =
            completed + partial + self.failed.get() + self.timed_out.get() + self.cancelled.get();

        MetricsSnapshot {
            submitted: self.submitted.get(),
            rejected: self.rejected.get(),
            completed,
            partial,
            failed: self.failed.get(),
            timed_out: self.timed_out.get(),
            cancelled: self.cancelled.get(),
            retries: self.retries.get(),
            fallbacks: self.fallbacks.get(),
            provider_calls: self.provider_calls.get(),
            running: self.running.get(),
            peak_running: self.running.peak(),
            success_rate: if finished == 0 {
                0.0
            } else {
                (completed + partial) as f64 / finished as f64
            },
            latency_p50_ms: latency.p50(),
            latency_p90_ms: latency.p90(),
            latency_p99_ms: latency.p99(),
            latency_mean_ms: latency.mean,
        }
    }
}

/// Serializable view of [`OrchestratorMetrics`]
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    /// Tasks accepted
    pub submitted: u64,
    /// Submissions rejected
    pub rejected: u64,
    /// Fully successful tasks
    pub completed: u64,
    /// Partially successful tasks
    pub partial: u64,
    /// Failed tasks
    pub failed: u64,
    /// Timed out tasks
    pub timed_out: u64,
    /// Cancelled tasks
    pub cancelled: u64,
    /// Retried provider calls
    pub retries: u64,
    /// Fallbacks to the next provider
    pub fallbacks: u64,
    /// Provider calls made
    pub provider_calls: u64,
    /// Tasks running now
    pub running: u64,
    /// Most tasks ever running at once
    pub peak_running: u64,
    /// Share of finished tasks that produced output
    pub success_rate: f64,
    /// Median task latency (bucket upper bound)
    pub latency_p50_ms: f64,
    /// p90 task latency
    pub latency_p90_ms: f64,
    /// p99 task latency
    pub latency_p99_ms: f64,
    /// Mean task latency
    pub latency_mean_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let histogram = Histogram::latency_default();
        for _ in 0..90 {
            histogram.record(20.0);
        }
        for _ in 0..10 {
            histogram.record(4000.0);
        }

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.total, 100);
        assert_eq!(snapshot.min, 20);
        assert_eq!(snapshot.max, 4000);
        assert_eq!(snapshot.p50(), 25.0);
        assert_eq!(snapshot.p90(), 25.0);
        assert_eq!(snapshot.p99(), 5000.0);
    }

    #[test]
    fn test_single_sample_percentile() {
        let histogram = Histogram::latency_default();
        histogram.record(300.0);
        assert_eq!(histogram.snapshot().p50(), 500.0);
        assert_eq!(Histogram::latency_default().snapshot().p50(), 0.0);
    }

    #[test]
    fn test_peak_gauge() {
        let gauge = PeakGauge::default();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        gauge.inc();
        gauge.dec();
        gauge.dec();

        assert_eq!(gauge.get(), 0);
        assert_eq!(gauge.peak(), 2);
    }

    #[test]
    fn test_success_rate() {
        let metrics = OrchestratorMetrics::default();
        metrics.completed.inc();
        metrics.partial.inc();
        metrics.failed.inc();
        metrics.cancelled.inc();

        let snapshot = metrics.snapshot();
        assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
    }
}
