//! Retry logic.
//!
//! # Responsibilities
//! - Classify failures as retryable or final
//! - Execute retries with exponential backoff + jitter
//! - Honor server wait hints (`Retry-After`) exactly
//!
//! # Design Decisions
//! - Rejections (breaker open, bulkhead full) are never retried
//! - Connection errors, timeouts, 5xx and 429 are retryable
//! - Computed delays never shrink across one call

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProxyError, Result, TransportError};
use crate::observability::metrics;
use crate::resilience::backoff::{calculate_backoff, DEFAULT_JITTER};

type RetryPredicate = Arc<dyn Fn(&ProxyError) -> bool + Send + Sync>;

/// Default failure classification.
pub fn is_retryable_error(err: &ProxyError) -> bool {
    match err {
        ProxyError::Transport(t) => matches!(
            t,
            TransportError::ConnectionRefused(_)
                | TransportError::Dns(_)
                | TransportError::Timeout(_)
                | TransportError::Connect(_)
                | TransportError::Io(_)
        ),
        ProxyError::Upstream { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

/// How a call is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_backoff: bool,
    pub jitter_range: (f64, f64),
    is_retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            exponential_backoff: true,
            jitter_range: DEFAULT_JITTER,
            is_retryable: Arc::new(is_retryable_error),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_backoff", &self.exponential_backoff)
            .field("jitter_range", &self.jitter_range)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_backoff(mut self, exponential: bool) -> Self {
        self.exponential_backoff = exponential;
        self
    }

    /// Jitter factor bounds; `(1.0, 1.0)` disables jitter.
    pub fn with_jitter_range(mut self, low: f64, high: f64) -> Self {
        self.jitter_range = (low.min(high), low.max(high));
        self
    }

    /// Replace the failure classifier.
    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ProxyError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, err: &ProxyError) -> bool {
        (self.is_retryable)(err)
    }

    /// Delay before retry number `attempt` (0-based) after `err`.
    pub fn delay_for(&self, attempt: u32, err: &ProxyError) -> Duration {
        if let Some(hint) = err.retry_after() {
            return hint;
        }
        calculate_backoff(
            attempt,
            self.base_delay,
            self.max_delay,
            self.exponential_backoff,
            self.jitter_range,
        )
    }
}

/// Runs an async operation under a `RetryPolicy`.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Call `op` until it succeeds, fails with a final error, or the budget runs out.
    pub async fn execute<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        // Only computed delays are kept non-decreasing; a server hint is used as-is.
        let mut last_computed = Duration::ZERO;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.policy.max_retries || !self.policy.is_retryable(&err) {
                return Err(err);
            }

            let delay = match err.retry_after() {
                Some(hint) => hint,
                None => {
                    last_computed = self.policy.delay_for(attempt, &err).max(last_computed);
                    last_computed
                }
            };
            attempt += 1;

            tracing::debug!(
                name = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            metrics::record_retry(name);
            tokio::time::sleep(delay).await;
        }
    }
}
