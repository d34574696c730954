//! Uniform forwarding result.
//!
//! Every forward ends in a [`ProxyResult`]: the upstream's answer, or a 503
//! envelope describing why there is none.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;
use std::time::Duration;

/// Response body as understood by the proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyBody {
    Json(serde_json::Value),
    Text(String),
    /// Non-UTF-8 payloads, passed through untouched.
    Binary(Bytes),
    Empty,
}

impl ProxyBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ProxyBody::Json(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyResult {
    pub status: StatusCode,
    pub body: ProxyBody,
    pub headers: HeaderMap,
    pub latency: Duration,
    /// Set on failure.
    pub upstream: Option<String>,
    /// Set on failure; `"unknown"` for direct calls.
    pub service_name: Option<String>,
}

impl ProxyResult {
    pub fn new(status: StatusCode, body: ProxyBody, headers: HeaderMap, latency: Duration) -> Self {
        Self {
            status,
            body,
            headers,
            latency,
            upstream: None,
            service_name: None,
        }
    }

    /// The 503 envelope.
    pub fn unavailable(
        message: impl Into<String>,
        upstream: &str,
        service_name: Option<&str>,
        latency: Duration,
    ) -> Self {
        let service = service_name.unwrap_or("unknown");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ProxyBody::Json(json!({
                "error": "Service unavailable",
                "message": message.into(),
                "upstream": upstream,
                "serviceName": service,
            })),
            headers,
            latency,
            upstream: Some(upstream.to_string()),
            service_name: Some(service.to_string()),
        }
    }
}

impl IntoResponse for ProxyResult {
    fn into_response(self) -> Response {
        let mut headers = self.headers;
        // Framing is recomputed for the re-encoded body.
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);

        let body = match self.body {
            ProxyBody::Json(value) => {
                if !headers.contains_key(header::CONTENT_TYPE) {
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                match serde_json::to_vec(&value) {
                    Ok(bytes) => Body::from(bytes),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode response body");
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                }
            }
            ProxyBody::Text(text) => Body::from(text),
            ProxyBody::Binary(bytes) => Body::from(bytes),
            ProxyBody::Empty => Body::empty(),
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}
