//! Named bundles of breaker, retry, bulkhead and timeout settings.

use std::time::Duration;

use crate::resilience::bulkhead::BulkheadConfig;
use crate::resilience::retries::RetryPolicy;
use crate::resilience::state::BreakerConfig;

pub const EXTERNAL_API: &str = "external_api";
pub const INTERNAL_SERVICE: &str = "internal_service";
pub const DATABASE: &str = "database";
pub const AI_PROVIDER: &str = "ai_provider";

/// Everything a pipeline is built from.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub bulkhead: Option<BulkheadConfig>,
    /// Per-attempt deadline.
    pub call_timeout: Option<Duration>,
    pub stats_window: Duration,
    pub stats_buckets: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            bulkhead: None,
            call_timeout: None,
            stats_window: Duration::from_secs(10),
            stats_buckets: 10,
        }
    }
}

impl PipelineOptions {
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: Option<BulkheadConfig>) -> Self {
        self.bulkhead = bulkhead;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_stats_window(mut self, window: Duration, buckets: u32) -> Self {
        self.stats_window = window;
        self.stats_buckets = buckets.max(1);
        self
    }
}

fn preset(
    breaker: (u32, u32, u64, u64),
    retry: (u32, u64, u64),
    bulkhead: (usize, usize),
    timeout_secs: u64,
) -> PipelineOptions {
    let (failures, successes, open_secs, window_secs) = breaker;
    let (max_retries, base_ms, max_ms) = retry;
    PipelineOptions::default()
        .with_breaker(
            BreakerConfig::new()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_open_timeout(Duration::from_secs(open_secs))
                .with_monitoring_window(Duration::from_secs(window_secs)),
        )
        .with_retry(
            RetryPolicy::new()
                .with_max_retries(max_retries)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms)),
        )
        .with_bulkhead(Some(BulkheadConfig::new(bulkhead.0, bulkhead.1)))
        .with_call_timeout(Some(Duration::from_secs(timeout_secs)))
}

/// Third-party HTTP APIs: moderate tolerance, long cool-down.
pub fn external_api() -> PipelineOptions {
    preset((5, 2, 60, 60), (3, 1000, 30_000), (20, 50), 10)
}

/// Services inside the cluster: fail and recover quickly.
pub fn internal_service() -> PipelineOptions {
    preset((10, 3, 30, 60), (2, 200, 5_000), (50, 100), 5)
}

pub fn database() -> PipelineOptions {
    preset((3, 1, 15, 30), (2, 100, 2_000), (10, 20), 5)
}

/// Slow model providers: few slots, generous deadlines.
pub fn ai_provider() -> PipelineOptions {
    preset((3, 1, 120, 300), (2, 2000, 60_000), (5, 10), 120)
}

/// Built-in preset by name. Accepts `snake_case` and `camelCase`.
pub fn builtin(name: &str) -> Option<PipelineOptions> {
    match name {
        EXTERNAL_API | "externalApi" => Some(external_api()),
        INTERNAL_SERVICE | "internalService" => Some(internal_service()),
        DATABASE => Some(database()),
        AI_PROVIDER | "aiProvider" => Some(ai_provider()),
        _ => None,
    }
}
