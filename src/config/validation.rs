//! Configuration validation.
//!
//! Serde handles syntax; this module checks value floors and route sanity.
//! All errors are collected rather than stopping at the first one.

use std::fmt;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be greater than zero"));
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    positive(&mut errors, "listener.request_timeout_ms", config.listener.request_timeout_ms);
    positive(&mut errors, "proxy.timeout_ms", config.proxy.timeout_ms);
    positive(&mut errors, "proxy.max_body_bytes", config.proxy.max_body_bytes as u64);

    let breaker = &config.breaker;
    positive(&mut errors, "breaker.timeout_ms", breaker.timeout_ms);
    positive(&mut errors, "breaker.reset_timeout_ms", breaker.reset_timeout_ms);
    positive(&mut errors, "breaker.volume_threshold", breaker.volume_threshold as u64);
    positive(&mut errors, "breaker.success_threshold", breaker.success_threshold as u64);
    positive(&mut errors, "breaker.rolling_count_timeout_ms", breaker.rolling_count_timeout_ms);
    positive(&mut errors, "breaker.rolling_count_buckets", breaker.rolling_count_buckets as u64);
    if !(1..=100).contains(&breaker.error_threshold_percentage) {
        errors.push(ValidationError::new(
            "breaker.error_threshold_percentage",
            "must be between 1 and 100",
        ));
    }
    if breaker.rolling_count_buckets > 0
        && breaker.rolling_count_timeout_ms % breaker.rolling_count_buckets as u64 != 0
    {
        errors.push(ValidationError::new(
            "breaker.rolling_count_buckets",
            "must evenly divide rolling_count_timeout_ms",
        ));
    }

    positive(&mut errors, "retry.delay_ms", config.retry.delay_ms);
    if config.retry.max_delay_ms < config.retry.delay_ms {
        errors.push(ValidationError::new(
            "retry.max_delay_ms",
            "must not be smaller than retry.delay_ms",
        ));
    }

    if config.bulkhead.enabled {
        positive(&mut errors, "bulkhead.max_concurrent", config.bulkhead.max_concurrent as u64);
    }

    if config.store.key_prefix.is_empty() {
        errors.push(ValidationError::new("store.key_prefix", "must not be empty"));
    }

    if let Some(url) = &config.store.url {
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            errors.push(ValidationError::new(
                "store.url",
                "must start with redis:// or rediss://",
            ));
        }
    }

    if config.admin.enabled && config.admin.api_key.is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must not be empty"));
    }

    for (i, route) in config.routes.iter().enumerate() {
        let field = format!("routes[{}]", i);
        if !route.prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("{}.prefix", field),
                "must start with '/'",
            ));
        }
        if url::Url::parse(&route.upstream).is_err() {
            errors.push(ValidationError::new(
                format!("{}.upstream", field),
                format!("'{}' is not a valid URL", route.upstream),
            ));
        }
        if matches!(route.service.as_deref(), Some("")) {
            errors.push(ValidationError::new(
                format!("{}.service", field),
                "must not be empty when set",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
