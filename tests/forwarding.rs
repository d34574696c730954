//! In-process forwarding tests with scripted transports.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilient_proxy::error::TransportError;
use resilient_proxy::http::{
    HttpTransport, OutboundRequest, ProxyBody, ProxyRequest, ResilientClient, ReverseProxy,
    TransportResponse,
};
use resilient_proxy::resilience::{
    BreakerConfig, CircuitState, EventKind, PipelineOptions, ResilienceManager, RetryPolicy,
};

#[derive(Default)]
struct Panics {
    calls: AtomicU32,
}

#[async_trait]
impl HttpTransport for Panics {
    async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("transport exploded");
    }
}

/// Answers with a fixed content type and body.
struct Fixed {
    content_type: &'static str,
    body: &'static [u8],
    calls: AtomicU32,
}

impl Fixed {
    fn new(content_type: &'static str, body: &'static [u8]) -> Self {
        Self {
            content_type,
            body,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl HttpTransport for Fixed {
    async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        Ok(TransportResponse::new(StatusCode::OK, headers, Bytes::from_static(self.body)))
    }
}

/// Upstream that refuses every connection.
struct Refused;

#[async_trait]
impl HttpTransport for Refused {
    async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        Err(TransportError::ConnectionRefused("127.0.0.1:1".to_string()))
    }
}

/// Never answers.
struct Hangs;

#[async_trait]
impl HttpTransport for Hangs {
    async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        std::future::pending().await
    }
}

fn proxy(transport: Arc<dyn HttpTransport>) -> ReverseProxy {
    let defaults = PipelineOptions::default().with_retry(RetryPolicy::none());
    ReverseProxy::new(Arc::new(ResilienceManager::new(defaults)), transport)
}

#[tokio::test]
async fn panicking_transport_becomes_unknown_error() {
    let proxy = proxy(Arc::new(Panics::default()));

    for service in [None, Some("users")] {
        let result = proxy
            .forward(ProxyRequest::new(Method::GET, "/users"), "http://users.internal", service)
            .await;
        assert_eq!(result.status, StatusCode::SERVICE_UNAVAILABLE);
        let body = result.body.as_json().unwrap();
        assert_eq!(body["message"], "Unknown error");
    }

    let stats = proxy.stats().await;
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.failed_requests, 2);
}

#[tokio::test]
async fn panicking_service_transport_opens_breaker() {
    let transport = Arc::new(Panics::default());
    let defaults = PipelineOptions::default()
        .with_retry(RetryPolicy::none())
        .with_breaker(BreakerConfig::new().with_failure_threshold(2));
    let proxy = ReverseProxy::new(Arc::new(ResilienceManager::new(defaults)), transport.clone());

    for _ in 0..5 {
        let result = proxy
            .forward(ProxyRequest::new(Method::GET, "/"), "http://svc.internal", Some("svc"))
            .await;
        assert_eq!(result.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.manager().state("svc").await, Some(CircuitState::Open));
    let stats = proxy.manager().stats("svc").await.unwrap();
    assert_eq!(stats.failures, 2);
    assert_eq!(stats.rejects, 3);
}

#[tokio::test]
async fn registered_client_fallback_serves_forward() {
    let transport: Arc<dyn HttpTransport> = Arc::new(Refused);
    let proxy = proxy(transport.clone());
    proxy.register_client(
        ResilientClient::new("users", proxy.manager().clone(), transport).with_fallback(|_| {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Some(TransportResponse::new(
                StatusCode::OK,
                headers,
                Bytes::from_static(br#"{"cached":true}"#),
            ))
        }),
    );

    let result = proxy
        .forward(ProxyRequest::new(Method::GET, "/users"), "http://users.internal", Some("users"))
        .await;
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.body.as_json().unwrap()["cached"], true);

    let stats = proxy.manager().stats("users").await.unwrap();
    assert_eq!(stats.fallbacks, 1);

    let direct = proxy
        .forward(ProxyRequest::new(Method::GET, "/users"), "http://users.internal", None)
        .await;
    assert_eq!(direct.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn bodies_are_parsed_by_content_type() {
    let json = proxy(Arc::new(Fixed::new("application/json; charset=utf-8", br#"{"id":7}"#)));
    let result = json
        .forward(ProxyRequest::new(Method::GET, "/"), "http://a.internal", None)
        .await;
    assert_eq!(result.body.as_json().unwrap()["id"], 7);

    let text = proxy(Arc::new(Fixed::new("text/plain", b"hello")));
    let result = text
        .forward(ProxyRequest::new(Method::GET, "/"), "http://a.internal", None)
        .await;
    assert_eq!(result.body, ProxyBody::Text("hello".to_string()));

    let broken = proxy(Arc::new(Fixed::new("application/json", b"{not json")));
    let result = broken
        .forward(ProxyRequest::new(Method::GET, "/"), "http://a.internal", None)
        .await;
    assert_eq!(result.body, ProxyBody::Text("{not json".to_string()));
}

#[tokio::test]
async fn stats_reads_do_not_change_stats() {
    let transport = Arc::new(Fixed::new("text/plain", b"ok"));
    let proxy = proxy(transport.clone());
    proxy
        .forward(ProxyRequest::new(Method::GET, "/"), "http://a.internal", Some("a"))
        .await;

    let first = proxy.stats().await;
    let second = proxy.stats().await;
    assert_eq!(first, second);
    assert_eq!(first.services.len(), 1);
    assert_eq!(first.services[0].successes, 1);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn destroy_aborts_in_flight_direct_calls() {
    let proxy = Arc::new(proxy(Arc::new(Hangs)).with_timeout(Duration::from_secs(60)));
    let inflight = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            proxy
                .forward(ProxyRequest::new(Method::GET, "/slow"), "http://slow.internal", None)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    proxy.destroy();

    let result = tokio::time::timeout(Duration::from_secs(1), inflight)
        .await
        .expect("call should be aborted")
        .unwrap();
    assert_eq!(result.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(result.body.as_json().unwrap()["message"]
        .as_str()
        .unwrap()
        .contains("shutting down"));
}

#[tokio::test]
async fn service_calls_emit_events() {
    let proxy = proxy(Arc::new(Fixed::new("text/plain", b"ok")));
    let seen = Arc::new(AtomicU32::new(0));
    let counter = seen.clone();
    proxy.manager().on(move |event| {
        if event.kind == EventKind::Success {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    proxy
        .forward(ProxyRequest::new(Method::GET, "/"), "http://a.internal", Some("a"))
        .await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
