//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::bulkhead::BulkheadConfig;
use crate::resilience::circuit_breaker::BreakerConfig;
use crate::resilience::presets::PipelineOptions;
use crate::resilience::retries::RetryPolicy;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Forwarding behaviour of the reverse proxy.
    pub proxy: ProxySettings,

    /// Circuit breaker knobs.
    pub breaker: BreakerSettings,

    /// Retry configuration.
    pub retry: RetrySettings,

    /// Default bulkhead limits for services.
    pub bulkhead: BulkheadSettings,

    /// Shared breaker state store.
    pub store: StoreSettings,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    /// Route definitions mapping path prefixes to upstreams.
    pub routes: Vec<RouteConfig>,
}

impl GatewayConfig {
    /// Pipeline options used for services without a preset.
    pub fn pipeline_defaults(&self) -> PipelineOptions {
        PipelineOptions::default()
            .with_breaker(self.breaker.to_breaker_config())
            .with_retry(self.retry.to_policy())
            .with_bulkhead(self.bulkhead.to_bulkhead_config())
            .with_call_timeout(Some(self.breaker.call_timeout()))
            .with_stats_window(self.breaker.rolling_window(), self.breaker.rolling_count_buckets)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Overall deadline for one inbound request, retries included.
    pub request_timeout_ms: u64,
}

impl ListenerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 120_000,
        }
    }
}

/// Reverse proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Deadline for direct (non-resilient) upstream calls in milliseconds.
    pub timeout_ms: u64,

    /// Value of the `x-forwarded-by` header.
    pub gateway_id: String,

    /// Value of the outbound `user-agent` header.
    pub user_agent: String,

    /// Maximum buffered request body size.
    pub max_body_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            gateway_id: "resilient-proxy".to_string(),
            user_agent: "resilient-proxy/0.1".to_string(),
            max_body_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

impl ProxySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Circuit breaker knobs, expressed the way operators usually tune them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Per-attempt call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Share of the volume threshold that must fail before the circuit opens.
    pub error_threshold_percentage: u32,

    /// Time spent Open before a probe is admitted, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Number of calls the percentage is applied to.
    pub volume_threshold: u32,

    /// Rolling statistics window in milliseconds.
    pub rolling_count_timeout_ms: u64,

    /// Number of buckets the rolling window is split into.
    pub rolling_count_buckets: u32,

    /// Consecutive half-open successes needed to close.
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            error_threshold_percentage: 50,
            reset_timeout_ms: 30_000,
            volume_threshold: 10,
            rolling_count_timeout_ms: 60_000,
            rolling_count_buckets: 10,
            success_threshold: 2,
        }
    }
}

impl BreakerSettings {
    /// Failures needed inside the window: `ceil(volume × pct / 100)`, at least one.
    pub fn failure_threshold(&self) -> u32 {
        let failures = (self.volume_threshold as u64 * self.error_threshold_percentage as u64)
            .div_ceil(100);
        failures.max(1) as u32
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_count_timeout_ms)
    }

    /// Resolve into the breaker's runtime configuration.
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold(),
            success_threshold: self.success_threshold.max(1),
            open_timeout: Duration::from_millis(self.reset_timeout_ms),
            monitoring_window: self.rolling_window(),
            half_open_max_probes: 1,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of retry attempts after the first call.
    pub max_retries: u32,

    /// Base delay for backoff in milliseconds.
    pub delay_ms: u64,

    /// Upper bound for a single computed delay in milliseconds.
    pub max_delay_ms: u64,

    /// Double the delay on every attempt.
    pub exponential_backoff: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_backoff: true,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(self.max_retries)
            .with_base_delay(Duration::from_millis(self.delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_exponential_backoff(self.exponential_backoff)
    }
}

/// Default bulkhead limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BulkheadSettings {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub max_queue_length: usize,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 50,
            max_queue_length: 100,
        }
    }
}

impl BulkheadSettings {
    pub fn to_bulkhead_config(&self) -> Option<BulkheadConfig> {
        self.enabled.then(|| BulkheadConfig {
            max_concurrent: self.max_concurrent,
            max_queue_length: self.max_queue_length,
        })
    }
}

/// Shared store used for fleet-wide breaker state.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Keep breaker state in the shared store instead of process memory.
    pub enabled: bool,

    /// Key prefix; records live at `<prefix>:<name>`, events on `<prefix>:events`.
    pub key_prefix: String,

    /// Redis URL. Without one the store lives in process memory (single node).
    pub url: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            key_prefix: "circuit".to_string(),
            url: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the admin routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// Route configuration mapping a path prefix to an upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Path prefix to match; stripped before forwarding.
    pub prefix: String,

    /// Upstream base URL (e.g., "http://127.0.0.1:3000").
    pub upstream: String,

    /// Service name; when set, calls go through the resilient client.
    #[serde(default)]
    pub service: Option<String>,

    /// Preset applied to the service pipeline.
    #[serde(default)]
    pub preset: Option<String>,
}
