//! Run-level metrics.
//!
//! Each run owns one [`RunMetrics`] accumulator. Workers update it through
//! atomic counters, so it is the only state they share apart from the sink;
//! nothing here is global. The benchmark harness reads one accumulator per
//! strategy run and merges the snapshots itself.
//!
//! Memory is reported as growth over the resident set size sampled when the
//! accumulator was created, so a run is not charged for what the process
//! already held.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Append-only counters for one pipeline run.
#[derive(Debug, Default)]
pub struct RunMetrics {
    chunks_completed: AtomicU64,
    records_seen: AtomicU64,
    records_valid: AtomicU64,
    records_invalid: AtomicU64,
    rows_written: AtomicU64,
    rows_skipped_duplicate: AtomicU64,
    retries: AtomicU64,
    baseline_rss_bytes: Option<u64>,
    peak_rss_bytes: AtomicU64,
    chunk_latency_ms: Mutex<LatencyHistogram>,
}

impl RunMetrics {
    /// Fresh accumulator; samples the current RSS as the memory baseline.
    pub fn new() -> Self {
        let baseline = current_rss_bytes();
        Self {
            baseline_rss_bytes: baseline,
            peak_rss_bytes: AtomicU64::new(baseline.unwrap_or(0)),
            ..Self::default()
        }
    }

    pub fn record_chunk(&self, seen: u64, valid: u64, invalid: u64, latency: Duration) {
        self.chunks_completed.fetch_add(1, Ordering::Relaxed);
        self.records_seen.fetch_add(seen, Ordering::Relaxed);
        self.records_valid.fetch_add(valid, Ordering::Relaxed);
        self.records_invalid.fetch_add(invalid, Ordering::Relaxed);
        self.chunk_latency_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency.as_secs_f64() * 1000.0);
        self.sample_memory();
    }

    pub fn record_load(&self, written: u64, skipped: u64) {
        self.rows_written.fetch_add(written, Ordering::Relaxed);
        self.rows_skipped_duplicate.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn record_retries(&self, retries: u64) {
        self.retries.fetch_add(retries, Ordering::Relaxed);
    }

    /// Fold the current resident set size into the peak.
    pub fn sample_memory(&self) {
        if let Some(rss) = current_rss_bytes() {
            self.peak_rss_bytes.fetch_max(rss, Ordering::Relaxed);
        }
    }

    /// Peak RSS growth over the baseline in MiB; `None` where RSS is not
    /// measurable.
    #[allow(clippy::cast_precision_loss)]
    pub fn peak_memory_mb(&self) -> Option<f64> {
        let baseline = self.baseline_rss_bytes?;
        let peak = self.peak_rss_bytes.load(Ordering::Relaxed);
        Some(peak.saturating_sub(baseline) as f64 / BYTES_PER_MIB)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self
            .chunk_latency_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats();
        MetricsSnapshot {
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            records_seen: self.records_seen.load(Ordering::Relaxed),
            records_valid: self.records_valid.load(Ordering::Relaxed),
            records_invalid: self.records_invalid.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_skipped_duplicate: self.rows_skipped_duplicate.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            peak_memory_mb: self.peak_memory_mb(),
            chunk_latency_ms: latency,
        }
    }
}

/// Point-in-time copy of a [`RunMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub chunks_completed: u64,
    pub records_seen: u64,
    pub records_valid: u64,
    pub records_invalid: u64,
    pub rows_written: u64,
    pub rows_skipped_duplicate: u64,
    pub retries: u64,
    pub peak_memory_mb: Option<f64>,
    pub chunk_latency_ms: HistogramStats,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> Value {
        json!({
            "chunks_completed": self.chunks_completed,
            "records": {
                "seen": self.records_seen,
                "valid": self.records_valid,
                "invalid": self.records_invalid,
            },
            "rows": {
                "written": self.rows_written,
                "skipped_duplicate": self.rows_skipped_duplicate,
            },
            "retries": self.retries,
            "peak_memory_mb": self.peak_memory_mb,
            "chunk_latency_ms": {
                "count": self.chunk_latency_ms.count,
                "mean": self.chunk_latency_ms.mean,
                "p50": self.chunk_latency_ms.p50,
                "p95": self.chunk_latency_ms.p95,
                "p99": self.chunk_latency_ms.p99,
                "max": self.chunk_latency_ms.max,
            },
        })
    }
}

/// Summary statistics over a set of samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

const LATENCY_BUCKETS: usize = 64;
const SMALLEST_BUCKET_MS: f64 = 0.01;

/// Bounded latency histogram. Count, sum, min and max are exact;
/// percentiles resolve to log-spaced buckets growing by a factor of sqrt 2
/// from 10 µs, clamped to the observed range.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    buckets: [u64; LATENCY_BUCKETS],
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: 0.0,
            buckets: [0; LATENCY_BUCKETS],
        }
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    fn upper_bound(bucket: usize) -> f64 {
        SMALLEST_BUCKET_MS * 2f64.powf(bucket as f64 / 2.0)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn bucket_for(ms: f64) -> usize {
        if ms <= SMALLEST_BUCKET_MS {
            return 0;
        }
        let idx = ((ms / SMALLEST_BUCKET_MS).log2() * 2.0).ceil();
        (idx as usize).min(LATENCY_BUCKETS - 1)
    }

    /// Add one sample in milliseconds; negative or non-finite samples count
    /// as zero.
    pub fn record(&mut self, ms: f64) {
        let ms = if ms.is_finite() { ms.max(0.0) } else { 0.0 };
        self.count += 1;
        self.sum += ms;
        self.min = self.min.min(ms);
        self.max = self.max.max(ms);
        self.buckets[Self::bucket_for(ms)] += 1;
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn percentile(&self, q: f64) -> f64 {
        let rank = ((q * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (bucket, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= rank {
                return Self::upper_bound(bucket).clamp(self.min, self.max);
            }
        }
        self.max
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> HistogramStats {
        if self.count == 0 {
            return HistogramStats::default();
        }
        HistogramStats {
            count: usize::try_from(self.count).unwrap_or(usize::MAX),
            sum: self.sum,
            mean: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
            p50: self.percentile(0.50),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
        }
    }
}

/// Resident set size of this process, from `/proc/self/status`.
#[cfg(target_os = "linux")]
pub fn current_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}

#[cfg(not(target_os = "linux"))]
pub fn current_rss_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counters_add_up_across_threads() {
        let m = Arc::new(RunMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || m.record_chunk(10, 9, 1, Duration::from_millis(2)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = m.snapshot();
        assert_eq!(s.chunks_completed, 4);
        assert_eq!(s.records_valid, 36);
        assert_eq!(s.chunk_latency_ms.count, 4);
    }

    #[test]
    fn histogram_percentiles() {
        let mut h = LatencyHistogram::new();
        for ms in 1..=100 {
            h.record(f64::from(ms));
        }
        let stats = h.stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.mean, 50.5);
        assert!((50.0..=72.0).contains(&stats.p50), "{}", stats.p50);
        assert!(stats.p95 >= 95.0 && stats.p95 <= 100.0);
        assert_eq!(stats.p99, 100.0);
        assert_eq!(LatencyHistogram::new().stats(), HistogramStats::default());
    }

    #[test]
    fn histogram_size_is_fixed() {
        let mut h = LatencyHistogram::new();
        for i in 0..100_000 {
            h.record(f64::from(i % 5_000) * 0.37);
        }
        h.record(1e12);
        h.record(f64::NAN);
        let stats = h.stats();
        assert_eq!(stats.count, 100_002);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 1e12);
        assert!(stats.p50 <= stats.p95 && stats.p95 <= stats.p99);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_is_measurable_on_linux() {
        assert!(current_rss_bytes().is_some_and(|b| b > 0));
        assert!(RunMetrics::new().peak_memory_mb().is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn memory_is_measured_from_the_baseline() {
        let ballast = std::hint::black_box(vec![1u8; 128 * 1024 * 1024]);
        let m = RunMetrics::new();
        m.sample_memory();
        let grown = m.peak_memory_mb().unwrap_or(f64::MAX);
        assert!(grown < 64.0, "charged {grown} MiB for memory held before the run");
        drop(ballast);
    }
}
