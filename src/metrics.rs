use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Number of buckets in the throughput histogram
pub const HISTOGRAM_BUCKETS: usize = 10;

/// Ack latency statistics, in microseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Publish-to-ack latency collector using HDR histogram
#[derive(Debug, Clone)]
pub struct LatencyCollector {
    histogram: Histogram<u64>,
}

impl LatencyCollector {
    /// Create a new latency collector
    pub fn new() -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self { histogram })
    }

    /// Empty collector with the same configuration as `self`
    pub fn fresh(&self) -> Self {
        Self {
            histogram: Histogram::new_from(&self.histogram),
        }
    }

    /// Record a latency measurement
    pub fn record(&mut self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.histogram.saturating_record(micros);
    }

    /// Fold another collector's samples into this one
    pub fn merge(&mut self, other: &LatencyCollector) {
        if let Err(e) = self.histogram.add(&other.histogram) {
            debug!("dropping latency samples that could not be merged: {:?}", e);
        }
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Current statistics, or `None` when nothing was recorded
    pub fn stats(&self) -> Option<LatencyStats> {
        if self.histogram.is_empty() {
            return None;
        }
        Some(LatencyStats {
            samples: self.histogram.len(),
            min_us: self.histogram.min(),
            max_us: self.histogram.max(),
            mean_us: self.histogram.mean(),
            std_dev_us: self.histogram.stdev(),
            p50_us: self.histogram.value_at_percentile(50.0),
            p95_us: self.histogram.value_at_percentile(95.0),
            p99_us: self.histogram.value_at_percentile(99.0),
        })
    }
}

/// One bar of the throughput histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub lower_bound: f64,
    /// Inclusive upper bound in msg/sec
    pub upper_bound: f64,
    pub count: usize,
    /// Fraction of `total` that falls in this bucket or any bucket below it
    pub cumulative: f64,
}

/// Median of an ascending series.
///
/// Odd lengths take the middle element, even lengths the mean of the two
/// middle elements.
pub fn median(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Split an ascending throughput series into [`HISTOGRAM_BUCKETS`] equal-width
/// buckets between its slowest and fastest value.
///
/// ## Parameters
/// - `sorted`: per-client throughput values, ascending
/// - `total`: denominator for the cumulative fractions
///
/// ## Returns
/// Empty when `sorted` is empty. Otherwise exactly [`HISTOGRAM_BUCKETS`]
/// buckets; the last upper bound is pinned to the fastest value so it is
/// always counted. A value sitting on a shared boundary lands in the lower
/// bucket.
pub fn build_histogram(sorted: &[f64], total: usize) -> Vec<HistogramBucket> {
    let (Some(&slowest), Some(&fastest)) = (sorted.first(), sorted.last()) else {
        return Vec::new();
    };

    let step = (fastest - slowest) / HISTOGRAM_BUCKETS as f64;
    let mut buckets: Vec<HistogramBucket> = (0..HISTOGRAM_BUCKETS)
        .map(|i| HistogramBucket {
            lower_bound: slowest + step * i as f64,
            upper_bound: if i + 1 == HISTOGRAM_BUCKETS {
                fastest
            } else {
                slowest + step * (i + 1) as f64
            },
            count: 0,
            cumulative: 0.0,
        })
        .collect();

    for &value in sorted {
        if let Some(bucket) = buckets.iter_mut().find(|b| value <= b.upper_bound) {
            bucket.count += 1;
        }
    }

    let denominator = total.max(1) as f64;
    let mut running = 0.0;
    for bucket in &mut buckets {
        running += bucket.count as f64 / denominator;
        bucket.cumulative = running;
    }
    buckets
}
