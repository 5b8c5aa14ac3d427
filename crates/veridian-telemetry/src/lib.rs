// TELEMETRY
// Counters, latency accounting, and the snapshot served by GetMetrics.
//
// INVARIANTS:
// 1. total == successful + failed at every observation point (total is
//    derived from the two atomics, never stored separately)
// 2. The reservoir never exceeds its cap; overflow keeps the most recent
//    half in arrival order
// 3. Every terminal request path records latency exactly once; only
//    successful paths touch last_inference
// 4. No I/O under the latency lock

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Reservoir sample cap. Overflow trims to the most recent half, so the
/// P99 stays tail-biased under sustained load.
pub const RESERVOIR_CAP: usize = 10_000;

// ==================== HISTOGRAM ====================

/// Fixed latency buckets, milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    pub under_10ms: u64,
    pub ms_10_to_50: u64,
    pub ms_50_to_100: u64,
    pub ms_100_to_500: u64,
    pub ms_500_to_1000: u64,
    pub over_1s: u64,
}

impl LatencyHistogram {
    pub fn record(&mut self, latency_ms: f64) {
        if latency_ms < 10.0 {
            self.under_10ms += 1;
        } else if latency_ms < 50.0 {
            self.ms_10_to_50 += 1;
        } else if latency_ms < 100.0 {
            self.ms_50_to_100 += 1;
        } else if latency_ms < 500.0 {
            self.ms_100_to_500 += 1;
        } else if latency_ms < 1000.0 {
            self.ms_500_to_1000 += 1;
        } else {
            self.over_1s += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.under_10ms
            + self.ms_10_to_50
            + self.ms_50_to_100
            + self.ms_100_to_500
            + self.ms_500_to_1000
            + self.over_1s
    }
}

// ==================== RESERVOIR ====================

/// Bounded sample buffer for percentile estimation. Not uniform sampling:
/// overflow drops the oldest half so recent behavior dominates.
#[derive(Debug)]
pub struct LatencyReservoir {
    cap: usize,
    samples: Vec<f64>,
}

impl LatencyReservoir {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            samples: Vec::new(),
        }
    }

    pub fn record(&mut self, latency_ms: f64) {
        if self.samples.len() >= self.cap {
            self.samples.drain(0..self.cap / 2);
        }
        self.samples.push(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `sorted[floor(0.99 * len)]`, index clamped to the last element.
    pub fn p99(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((0.99 * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
        sorted[idx]
    }
}

// ==================== METRICS ====================

#[derive(Debug)]
struct LatencyWindow {
    sum_ms: f64,
    count: u64,
    reservoir: LatencyReservoir,
    histogram: LatencyHistogram,
}

/// Process-wide request metrics. Counters are lock-free; latency state sits
/// behind one short-lived lock.
#[derive(Debug)]
pub struct InferenceMetrics {
    started_at: Instant,
    successful: AtomicU64,
    failed: AtomicU64,
    /// Epoch milliseconds of the last successful inference; 0 = never.
    last_inference_ms: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl InferenceMetrics {
    pub fn new() -> Self {
        Self::with_reservoir_cap(RESERVOIR_CAP)
    }

    pub fn with_reservoir_cap(cap: usize) -> Self {
        Self {
            started_at: Instant::now(),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_inference_ms: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow {
                sum_ms: 0.0,
                count: 0,
                reservoir: LatencyReservoir::new(cap),
                histogram: LatencyHistogram::default(),
            }),
        }
    }

    pub fn record_success(&self, latency_ms: f64) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.last_inference_ms
            .store(epoch_millis(), Ordering::Relaxed);
        self.record_latency(latency_ms);
    }

    pub fn record_failure(&self, latency_ms: f64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency_ms);
    }

    fn record_latency(&self, latency_ms: f64) {
        let mut window = self.latency.lock();
        window.sum_ms += latency_ms;
        window.count += 1;
        window.reservoir.record(latency_ms);
        window.histogram.record(latency_ms);
    }

    pub fn total(&self) -> u64 {
        self.successful.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_inference_epoch_ms(&self) -> Option<u64> {
        match self.last_inference_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let (avg, p99, histogram, reservoir_len) = {
            let window = self.latency.lock();
            let avg = if window.count > 0 {
                window.sum_ms / window.count as f64
            } else {
                0.0
            };
            (avg, window.reservoir.p99(), window.histogram, window.reservoir.len())
        };

        MetricsSnapshot {
            total: successful + failed,
            successful,
            failed,
            avg_latency_ms: avg,
            p99_latency_ms: p99,
            latency_histogram: histogram,
            reservoir_samples: reservoir_len,
            uptime_seconds: self.uptime_seconds(),
            last_inference_epoch_ms: self.last_inference_epoch_ms(),
        }
    }
}

impl Default for InferenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot for GetMetrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub latency_histogram: LatencyHistogram,
    pub reservoir_samples: usize,
    pub uptime_seconds: u64,
    pub last_inference_epoch_ms: Option<u64>,
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ==================== MEMORY ====================

/// Resident set size in MB from procfs. 0 when unavailable.
pub fn memory_usage_mb() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

// ==================== TESTS ====================
