//! Outbound HTTP transport.
//!
//! The proxy talks to upstreams only through [`HttpTransport`], so tests can
//! swap in a scripted transport. [`HyperTransport`] is the production
//! implementation on top of the hyper-util pooled client.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use bytes::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use std::error::Error as StdError;
use std::time::Duration;
use url::Url;

use crate::error::TransportError;

/// Largest upstream body the transport will buffer.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// A fully resolved request to an upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Deadline for the whole exchange, body included.
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A buffered upstream response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// True when the content type declares JSON (`application/json`, `*+json`).
    pub fn is_json(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
                mime == "application/json" || mime.ends_with("+json")
            })
            .unwrap_or(false)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `Retry-After` in its delay-seconds form.
    pub fn retry_after(&self) -> Option<Duration> {
        let raw = self.headers.get(header::RETRY_AFTER)?.to_str().ok()?;
        let secs: u64 = raw.trim().parse().ok()?;
        Some(Duration::from_secs(secs))
    }
}

/// Sends one request to an upstream.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// Pooled hyper client.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Body>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        Self { client }
    }

    async fn exchange(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = Request::builder()
            .method(request.method)
            .uri(request.url.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers);
        }
        let req = builder
            .body(Body::from(request.body))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let response = self.client.request(req).await.map_err(|e| classify(&e))?;
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(Body::new(body), MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        Ok(TransportResponse::new(parts.status, parts.headers, body))
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        match request.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(request))
                .await
                .map_err(|_| TransportError::Timeout(limit))?,
            None => self.exchange(request).await,
        }
    }
}

/// Map a client error onto the transport taxonomy by walking its source chain.
fn classify(err: &hyper_util::client::legacy::Error) -> TransportError {
    let message = err.to_string();
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return TransportError::ConnectionRefused(io.to_string());
                }
                std::io::ErrorKind::TimedOut => {
                    return TransportError::Connect(io.to_string());
                }
                _ => {}
            }
        }
        if let Some(h) = cause.downcast_ref::<hyper::Error>() {
            if h.is_canceled() {
                return TransportError::Aborted(h.to_string());
            }
        }
        if cause.to_string().starts_with("dns error") {
            return TransportError::Dns(cause.to_string());
        }
        source = cause.source();
    }

    if err.is_connect() {
        TransportError::Connect(message)
    } else {
        TransportError::Io(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn response(content_type: &str, body: &'static str) -> TransportResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        TransportResponse::new(StatusCode::OK, headers, Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn json_content_types() {
        assert!(response("application/json; charset=utf-8", "{}").is_json());
        assert!(response("application/problem+json", "{}").is_json());
        assert!(!response("text/plain", "{}").is_json());
    }

    #[test]
    fn retry_after_seconds_only() {
        let mut r = response("text/plain", "");
        r.headers.insert(header::RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(r.retry_after(), Some(Duration::from_secs(2)));

        r.headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(r.retry_after(), None);
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HyperTransport::new();
        let url = Url::parse(&format!("http://{}/", addr)).unwrap();
        let err = transport
            .send(OutboundRequest::new(Method::GET, url).with_timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }
}
