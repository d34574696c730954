//! Per-pipeline counters and rolling latency.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::resilience::events::CallCounts;
use crate::resilience::state::CircuitState;

/// Samples kept per bucket for percentile estimates.
const MAX_SAMPLES_PER_BUCKET: usize = 1024;

/// Latency over the rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Stats snapshot for one named pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub name: String,
    pub state: CircuitState,
    pub successes: u64,
    pub failures: u64,
    pub rejects: u64,
    pub fallbacks: u64,
    pub timeouts: u64,
    pub latency: LatencySummary,
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    slot: u64,
    count: u64,
    sum_ms: f64,
    samples: Vec<f64>,
}

#[derive(Debug)]
struct LatencyRing {
    started: Instant,
    width: Duration,
    buckets: Vec<Bucket>,
}

impl LatencyRing {
    fn current_slot(&self) -> u64 {
        let width = self.width.as_nanos().max(1);
        (self.started.elapsed().as_nanos() / width) as u64
    }

    fn record(&mut self, latency: Duration) {
        let slot = self.current_slot();
        let len = self.buckets.len() as u64;
        let bucket = &mut self.buckets[(slot % len) as usize];
        if bucket.slot != slot || bucket.count == 0 {
            *bucket = Bucket {
                slot,
                ..Bucket::default()
            };
        }
        let ms = latency.as_secs_f64() * 1000.0;
        bucket.count += 1;
        bucket.sum_ms += ms;
        if bucket.samples.len() < MAX_SAMPLES_PER_BUCKET {
            bucket.samples.push(ms);
        }
    }

    fn summary(&self) -> LatencySummary {
        let now = self.current_slot();
        let len = self.buckets.len() as u64;
        let live = self
            .buckets
            .iter()
            .filter(|b| b.count > 0 && now.saturating_sub(b.slot) < len);

        let mut count = 0;
        let mut sum = 0.0;
        let mut samples = Vec::new();
        for bucket in live {
            count += bucket.count;
            sum += bucket.sum_ms;
            samples.extend_from_slice(&bucket.samples);
        }
        if count == 0 {
            return LatencySummary::default();
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        LatencySummary {
            count,
            mean_ms: sum / count as f64,
            p50_ms: percentile(&samples, 50.0),
            p95_ms: percentile(&samples, 95.0),
            p99_ms: percentile(&samples, 99.0),
        }
    }
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Counters and latency for one pipeline.
#[derive(Debug)]
pub struct PipelineMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    rejects: AtomicU64,
    fallbacks: AtomicU64,
    timeouts: AtomicU64,
    latency: Mutex<LatencyRing>,
}

impl PipelineMetrics {
    /// Latency is kept over `window`, split into `buckets` slices.
    pub fn new(window: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        Self {
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            latency: Mutex::new(LatencyRing {
                started: Instant::now(),
                width: window / buckets,
                buckets: vec![Bucket::default(); buckets as usize],
            }),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_reject(&self) {
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency);
    }

    pub fn counts(&self) -> CallCounts {
        CallCounts {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn latency(&self) -> LatencySummary {
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
    }

    /// Read-only snapshot; nothing here resets or advances state.
    pub fn snapshot(&self, name: &str, state: CircuitState) -> PipelineStats {
        let counts = self.counts();
        PipelineStats {
            name: name.to_string(),
            state,
            successes: counts.successes,
            failures: counts.failures,
            rejects: counts.rejects,
            fallbacks: counts.fallbacks,
            timeouts: counts.timeouts,
            latency: self.latency(),
        }
    }
}
