//! Error types shared by the resilience layer and the proxy.

use std::time::Duration;
use thiserror::Error;

/// Failures of the network leg itself: nothing usable came back from the upstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("DNS lookup failed: {0}")]
    Dns(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("request aborted: {0}")]
    Aborted(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// A failure that could not be classified (including a panic inside the transport).
    #[error("Unknown error")]
    Unknown,
}

/// Errors surfaced by the resilience pipeline and the proxy.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The upstream answered, but with a status that counts as a failure.
    #[error("upstream responded with {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        /// Server-provided wait hint (`Retry-After`).
        retry_after: Option<Duration>,
    },

    #[error("circuit breaker is open for {name}")]
    BreakerOpen { name: String },

    #[error("bulkhead {name} is full ({max_concurrent} active, {max_queue_length} queued)")]
    BulkheadRejected {
        name: String,
        max_concurrent: usize,
        max_queue_length: usize,
    },

    #[error("method {method} cannot be forwarded through the resilient client")]
    UnsupportedMethod { method: String },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProxyError {
    /// True for errors raised before any network attempt was made.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ProxyError::BreakerOpen { .. }
                | ProxyError::BulkheadRejected { .. }
                | ProxyError::UnsupportedMethod { .. }
        )
    }

    /// The server-provided wait hint carried by this error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProxyError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for resilience and proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_error_message() {
        let err = ProxyError::from(TransportError::Unknown);
        assert_eq!(err.to_string(), "Unknown error");
    }

    #[test]
    fn rejections_are_classified() {
        assert!(ProxyError::BreakerOpen { name: "a".into() }.is_rejection());
        assert!(!ProxyError::Transport(TransportError::Timeout(Duration::from_secs(1))).is_rejection());
    }

    #[test]
    fn retry_after_only_on_upstream() {
        let err = ProxyError::Upstream {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(ProxyError::Configuration("x".into()).retry_after(), None);
    }
}
