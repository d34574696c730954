//! Resilient HTTP client, one per named service.
//!
//! Every call runs through the service's pipeline in the
//! [`ResilienceManager`], so bulkhead, breaker and retry policy all apply.
//! Upstream 5xx and 429 answers are turned into [`ProxyError::Upstream`] so
//! they count as failures and can be retried; other statuses are returned
//! as-is.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::http::transport::{HttpTransport, OutboundRequest, TransportResponse};
use crate::resilience::ResilienceManager;

/// Longest upstream body excerpt carried in an error message.
const MAX_ERROR_EXCERPT: usize = 200;

/// Produces a substitute response when a call ultimately fails.
pub type ClientFallback = Arc<dyn Fn(&ProxyError) -> Option<TransportResponse> + Send + Sync>;

pub struct ResilientClient {
    service: String,
    manager: Arc<ResilienceManager>,
    transport: Arc<dyn HttpTransport>,
    timeout: Option<Duration>,
    fallback: Option<ClientFallback>,
}

impl ResilientClient {
    pub fn new(
        service: impl Into<String>,
        manager: Arc<ResilienceManager>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            service: service.into(),
            manager,
            transport,
            timeout: None,
            fallback: None,
        }
    }

    /// Per-attempt transport deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Serve a substitute when the breaker is open or retries run out.
    /// Returning `None` lets the original error through.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&ProxyError) -> Option<TransportResponse> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn get(&self, url: Url, headers: HeaderMap) -> Result<TransportResponse> {
        self.request(Method::GET, url, headers, Bytes::new()).await
    }

    pub async fn post(&self, url: Url, headers: HeaderMap, body: Bytes) -> Result<TransportResponse> {
        self.request(Method::POST, url, headers, body).await
    }

    pub async fn put(&self, url: Url, headers: HeaderMap, body: Bytes) -> Result<TransportResponse> {
        self.request(Method::PUT, url, headers, body).await
    }

    pub async fn delete(&self, url: Url, headers: HeaderMap) -> Result<TransportResponse> {
        self.request(Method::DELETE, url, headers, Bytes::new()).await
    }

    /// Send through the pipeline. Only GET, POST, PUT and DELETE are accepted.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<TransportResponse> {
        if !matches!(method, Method::GET | Method::POST | Method::PUT | Method::DELETE) {
            return Err(ProxyError::UnsupportedMethod {
                method: method.to_string(),
            });
        }

        let mut request = OutboundRequest::new(method, url)
            .with_headers(headers)
            .with_body(body);
        request.timeout = self.timeout;

        let op = || {
            let request = request.clone();
            let transport = self.transport.clone();
            async move { check_status(transport.send(request).await?) }
        };

        match &self.fallback {
            Some(fallback) => {
                let fallback = fallback.clone();
                self.manager
                    .execute_with_fallback(&self.service, op, |err| async move {
                        match fallback(&err) {
                            Some(response) => Ok(response),
                            None => Err(err),
                        }
                    })
                    .await
            }
            None => self.manager.execute(&self.service, op).await,
        }
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("service", &self.service)
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

/// Treat 5xx and 429 as call failures.
fn check_status(response: TransportResponse) -> Result<TransportResponse> {
    let status = response.status;
    if !(status.is_server_error() || status.as_u16() == 429) {
        return Ok(response);
    }

    let text = response.text();
    let excerpt = text.trim();
    let message = if excerpt.is_empty() {
        status.canonical_reason().unwrap_or("upstream error").to_string()
    } else {
        excerpt.chars().take(MAX_ERROR_EXCERPT).collect()
    };
    Err(ProxyError::Upstream {
        status: status.as_u16(),
        message,
        retry_after: response.retry_after(),
    })
}
