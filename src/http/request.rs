//! Inbound request model.
//!
//! # Responsibilities
//! - Tag every request with an `x-request-id` (uuid v4) as early as possible
//! - Buffer the body up to the configured limit
//! - Capture method, path, query and headers for forwarding
//!
//! # Design Decisions
//! - Bodies are buffered so a retried call can resend them
//! - Query parameters are kept as decoded pairs and re-serialized outbound

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, Method, Request};
use bytes::Bytes;
use std::net::SocketAddr;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use url::form_urlencoded;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Layer that assigns an `x-request-id` to requests lacking one.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid)
}

/// Layer that copies the request id onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(X_REQUEST_ID)
}

/// Request id of an inbound request, or `"unknown"`.
pub fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

/// A buffered inbound request, ready to forward.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path relative to the upstream base URL.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub query: Vec<(String, String)>,
    /// Scheme the client used (`http` or `https`).
    pub protocol: String,
    /// Peer address of the inbound connection, when the server recorded it.
    pub remote_addr: Option<SocketAddr>,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            query: Vec::new(),
            protocol: "http".to_string(),
            remote_addr: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Buffer an axum request. `path` overrides the URI path (after prefix stripping).
    pub async fn from_axum(
        request: Request<Body>,
        path: String,
        max_body_bytes: usize,
    ) -> Result<Self, axum::Error> {
        let (parts, body) = request.into_parts();
        let query = parts
            .uri
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let protocol = parts
            .headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.scheme_str().map(str::to_string))
            .unwrap_or_else(|| "http".to_string());
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let body = axum::body::to_bytes(body, max_body_bytes).await?;

        Ok(Self {
            method: parts.method,
            path,
            headers: parts.headers,
            body,
            query,
            protocol,
            remote_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_axum_captures_query_and_body() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/users/7?expand=roles&q=a%20b")
            .header("x-request-id", "abc")
            .body(Body::from("{\"name\":\"ada\"}"))
            .unwrap();

        let proxied = ProxyRequest::from_axum(req, "/users/7".to_string(), 1024)
            .await
            .unwrap();
        assert_eq!(proxied.method, Method::POST);
        assert_eq!(proxied.path, "/users/7");
        assert_eq!(
            proxied.query,
            vec![
                ("expand".to_string(), "roles".to_string()),
                ("q".to_string(), "a b".to_string())
            ]
        );
        assert_eq!(proxied.protocol, "http");
        assert_eq!(request_id(&proxied.headers), "abc");
        assert_eq!(&proxied.body[..], b"{\"name\":\"ada\"}");
        assert_eq!(proxied.remote_addr, None);
    }

    #[tokio::test]
    async fn from_axum_records_peer_address() {
        let peer: SocketAddr = "198.51.100.4:52000".parse().unwrap();
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));

        let proxied = ProxyRequest::from_axum(req, "/".into(), 16).await.unwrap();
        assert_eq!(proxied.remote_addr, Some(peer));
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let req = Request::builder()
            .uri("/")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        assert!(ProxyRequest::from_axum(req, "/".into(), 16).await.is_err());
    }
}
