//! Reverse proxy.
//!
//! # Responsibilities
//! - Sanitize headers and stamp the forwarding identity
//! - Dispatch through a service's resilient client, or call the upstream directly
//! - Normalize every failure into the 503 envelope
//! - Record latency for every call
//!
//! # Design Decisions
//! - Direct calls get no retries; resilience lives in the manager layer
//! - A direct call is cancelled by its deadline or by `destroy()`
//! - A panic while forwarding is contained and reported as "Unknown error"

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result, TransportError};
use crate::http::client::ResilientClient;
use crate::http::headers::{sanitize_headers, ForwardingIdentity};
use crate::http::request::ProxyRequest;
use crate::http::response::{ProxyBody, ProxyResult};
use crate::http::transport::{HttpTransport, OutboundRequest, TransportResponse};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resilience::{CircuitState, PipelineStats, ResilienceManager};
use crate::store::{MemoryStore, RedisStore, SharedStore};

/// Label used for calls without a service name.
const DIRECT: &str = "direct";

/// Aggregate forwarding stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: f64,
    pub services: Vec<PipelineStats>,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    latency_micros: AtomicU64,
}

pub struct ReverseProxy {
    manager: Arc<ResilienceManager>,
    transport: Arc<dyn HttpTransport>,
    clients: DashMap<String, Arc<ResilientClient>>,
    identity: ForwardingIdentity,
    timeout: Duration,
    shutdown: Shutdown,
    counters: Counters,
}

impl ReverseProxy {
    pub fn new(manager: Arc<ResilienceManager>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            manager,
            transport,
            clients: DashMap::new(),
            identity: ForwardingIdentity::default(),
            timeout: Duration::from_secs(30),
            shutdown: Shutdown::new(),
            counters: Counters::default(),
        }
    }

    /// Build the proxy described by `config`, registering every routed service.
    pub async fn from_config(config: &GatewayConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let mut manager = ResilienceManager::new(config.pipeline_defaults());
        if config.store.enabled {
            let store: Arc<dyn SharedStore> = match &config.store.url {
                Some(url) => Arc::new(
                    RedisStore::connect(url)
                        .await
                        .map_err(|e| ProxyError::Configuration(format!("shared store: {}", e)))?,
                ),
                None => Arc::new(MemoryStore::new()),
            };
            manager = manager.with_store(store, config.store.key_prefix.clone());
        }

        let proxy = Self::new(Arc::new(manager), transport)
            .with_identity(ForwardingIdentity::new(&config.proxy.gateway_id, &config.proxy.user_agent))
            .with_timeout(config.proxy.timeout());

        for route in &config.routes {
            if let Some(service) = &route.service {
                proxy.register_service(service, route.preset.as_deref()).await?;
            }
        }
        Ok(proxy)
    }

    pub fn with_identity(mut self, identity: ForwardingIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Deadline for direct calls and for service clients created here.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn manager(&self) -> &Arc<ResilienceManager> {
        &self.manager
    }

    /// Register `name`, optionally configuring its pipeline from a preset.
    pub async fn register_service(&self, name: &str, preset: Option<&str>) -> Result<Arc<ResilientClient>> {
        if let Some(preset) = preset {
            self.manager.configure_with_preset(name, preset).await?;
        }
        let client = Arc::new(
            ResilientClient::new(name, self.manager.clone(), self.transport.clone()).with_timeout(self.timeout),
        );
        self.clients.insert(name.to_string(), client.clone());
        tracing::info!(service = %name, preset = ?preset, "Registered upstream service");
        Ok(client)
    }

    /// Register a pre-built client, e.g. one carrying a fallback.
    pub fn register_client(&self, client: ResilientClient) -> Arc<ResilientClient> {
        let client = Arc::new(client);
        self.clients.insert(client.service().to_string(), client.clone());
        client
    }

    /// The client for `name`, created with the default pipeline on first use.
    pub fn client(&self, name: &str) -> Arc<ResilientClient> {
        self.clients
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    ResilientClient::new(name, self.manager.clone(), self.transport.clone())
                        .with_timeout(self.timeout),
                )
            })
            .value()
            .clone()
    }

    /// Forward `request` to `upstream`. Never fails: errors become the 503 envelope.
    pub async fn forward(&self, request: ProxyRequest, upstream: &str, service: Option<&str>) -> ProxyResult {
        let started = Instant::now();
        let client = request.remote_addr;
        let headers = sanitize_headers(&request.headers, &request.protocol, &self.identity);

        let outcome = match build_url(upstream, &request.path, &request.query) {
            Ok(url) => AssertUnwindSafe(self.dispatch(request.method, url, headers, request.body, service))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(upstream = %upstream, service = ?service, "Forwarding panicked");
                    Err(TransportError::Unknown.into())
                }),
            Err(e) => Err(e),
        };

        let latency = started.elapsed();
        let result = match outcome {
            Ok(response) => into_result(response, latency),
            Err(err) => {
                if matches!(err, ProxyError::Transport(TransportError::Unknown)) {
                    tracing::error!(upstream = %upstream, service = ?service, "Unknown transport failure");
                } else if err.is_rejection() {
                    tracing::debug!(upstream = %upstream, service = ?service, error = %err, "Forwarding refused");
                } else {
                    tracing::warn!(
                        upstream = %upstream,
                        service = ?service,
                        client = ?client,
                        error = %err,
                        "Forwarding failed"
                    );
                }
                ProxyResult::unavailable(err.to_string(), upstream, service, latency)
            }
        };

        self.record(service.unwrap_or(DIRECT), &result);
        result
    }

    async fn dispatch(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
        service: Option<&str>,
    ) -> Result<TransportResponse> {
        match service {
            Some(name) => self.client(name).request(method, url, headers, body).await,
            None => {
                let request = OutboundRequest::new(method, url)
                    .with_headers(headers)
                    .with_body(body)
                    .with_timeout(self.timeout);
                self.direct(request).await
            }
        }
    }

    /// One attempt, bound to the deadline and to shutdown.
    async fn direct(&self, request: OutboundRequest) -> Result<TransportResponse> {
        let limit = self.timeout;
        tokio::select! {
            outcome = tokio::time::timeout(limit, self.transport.send(request)) => match outcome {
                Ok(result) => result.map_err(ProxyError::from),
                Err(_) => Err(TransportError::Timeout(limit).into()),
            },
            _ = self.shutdown.cancelled() => {
                Err(TransportError::Aborted("proxy is shutting down".to_string()).into())
            }
        }
    }

    fn record(&self, service: &str, result: &ProxyResult) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if result.upstream.is_some() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .latency_micros
            .fetch_add(result.latency.as_micros() as u64, Ordering::Relaxed);
        metrics::record_request(service, result.status.as_u16(), result.latency);
    }

    pub async fn stats(&self) -> ProxyStats {
        let total = self.counters.total.load(Ordering::Relaxed);
        let micros = self.counters.latency_micros.load(Ordering::Relaxed);
        ProxyStats {
            total_requests: total,
            successful_requests: self.counters.succeeded.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            average_latency_ms: if total == 0 {
                0.0
            } else {
                micros as f64 / total as f64 / 1000.0
            },
            services: self.manager.all_stats().await,
        }
    }

    /// Breaker state per service.
    pub async fn breaker_states(&self) -> BTreeMap<String, CircuitState> {
        let mut states = BTreeMap::new();
        for name in self.manager.names() {
            if let Some(state) = self.manager.state(&name).await {
                states.insert(name, state);
            }
        }
        states
    }

    /// Services whose breaker is not Closed.
    pub async fn unhealthy_upstreams(&self) -> Vec<String> {
        self.breaker_states()
            .await
            .into_iter()
            .filter(|(_, state)| *state != CircuitState::Closed)
            .map(|(name, _)| name)
            .collect()
    }

    pub async fn reset_breaker(&self, name: &str) -> bool {
        self.manager.reset(name).await
    }

    pub async fn reset_all_breakers(&self) {
        self.manager.reset_all().await;
    }

    /// Abort in-flight direct calls and release every pipeline.
    pub fn destroy(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        self.manager.shutdown_all();
        self.clients.clear();
        tracing::info!("Reverse proxy destroyed");
    }
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("services", &self.clients.len())
            .field("timeout", &self.timeout)
            .field("destroyed", &self.shutdown.is_triggered())
            .finish_non_exhaustive()
    }
}

/// Join `path` onto the upstream base and append `query`.
pub fn build_url(upstream: &str, path: &str, query: &[(String, String)]) -> Result<Url> {
    let base = upstream.trim_end_matches('/');
    let joined = if path.is_empty() || path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };
    let mut url = Url::parse(&joined)
        .map_err(|e| ProxyError::Configuration(format!("invalid upstream url '{}': {}", joined, e)))?;
    if !query.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Ok(url)
}

fn into_result(response: TransportResponse, latency: Duration) -> ProxyResult {
    let body = if response.body.is_empty() {
        ProxyBody::Empty
    } else if response.is_json() {
        match response.json::<serde_json::Value>() {
            Ok(value) => ProxyBody::Json(value),
            Err(_) => ProxyBody::Text(response.text()),
        }
    } else {
        match std::str::from_utf8(&response.body) {
            Ok(text) => ProxyBody::Text(text.to_string()),
            Err(_) => ProxyBody::Binary(response.body.clone()),
        }
    };
    ProxyResult::new(response.status, body, response.headers, latency)
}
