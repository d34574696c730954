//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the axum router: admin routes plus a catch-all forwarding handler
//! - Wire up middleware (request id, tracing, overall timeout)
//! - Bind to a listener and drain on shutdown
//! - Tear down the proxy once the server has stopped

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::json;
use std::error::Error as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::admin::setup_admin_router;
use crate::config::GatewayConfig;
use crate::http::proxy::ReverseProxy;
use crate::http::request::{propagate_request_id_layer, request_id, set_request_id_layer, ProxyRequest};
use crate::lifecycle::{wait_for_signal, Shutdown};
use crate::routing::RouteTable;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<ReverseProxy>,
    pub routes: Arc<RouteTable>,
    pub max_body_bytes: usize,
    pub admin_key: Arc<str>,
    pub started_at: Instant,
}

/// HTTP front end of the gateway.
pub struct GatewayServer {
    router: Router,
    proxy: Arc<ReverseProxy>,
    shutdown: Arc<Shutdown>,
}

impl GatewayServer {
    pub fn new(config: &GatewayConfig, proxy: Arc<ReverseProxy>, routes: RouteTable) -> Self {
        let state = AppState {
            proxy: proxy.clone(),
            routes: Arc::new(routes),
            max_body_bytes: config.proxy.max_body_bytes,
            admin_key: Arc::from(config.admin.api_key.as_str()),
            started_at: Instant::now(),
        };

        let router = Self::build_router(config, state);
        Self {
            router,
            proxy,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    #[allow(deprecated)]
    fn build_router(config: &GatewayConfig, state: AppState) -> Router {
        let mut router = Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state.clone());

        if config.admin.enabled {
            router = setup_admin_router(state).merge(router);
        }

        // Last layer added runs first: the id is set before the trace span opens.
        router
            .layer(TimeoutLayer::new(config.listener.request_timeout()))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    /// The fully layered router, for in-process use.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Handle that stops [`run`](Self::run) when triggered.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    /// Serve until SIGINT/SIGTERM or the shutdown handle fires, then destroy the proxy.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let shutdown = self.shutdown.clone();
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = wait_for_signal() => {}
                    _ = shutdown.cancelled() => {}
                }
            })
            .await?;

        self.proxy.destroy();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Match the path to a route and forward.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let started = Instant::now();
    let request_id = request_id(request.headers()).to_string();
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    let Some(matched) = state.routes.match_path(&path) else {
        tracing::warn!(request_id = %request_id, path = %path, "No route matched");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Not found", "path": path })),
        )
            .into_response();
    };
    let upstream = matched.route.upstream.clone();
    let service = matched.route.service.clone();

    let proxied = match ProxyRequest::from_axum(request, matched.upstream_path, state.max_body_bytes).await {
        Ok(proxied) => proxied,
        Err(e) => {
            let status = if exceeds_limit(&e) {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            tracing::warn!(request_id = %request_id, error = %e, status = %status, "Failed to read request body");
            return (status, Json(json!({ "error": status.canonical_reason() }))).into_response();
        }
    };

    tracing::debug!(
        request_id = %request_id,
        client = ?proxied.remote_addr,
        method = %method,
        path = %path,
        upstream = %upstream,
        service = ?service,
        "Proxying request"
    );

    let result = state.proxy.forward(proxied, &upstream, service.as_deref()).await;

    tracing::debug!(
        request_id = %request_id,
        status = %result.status,
        latency_ms = elapsed_ms(started.elapsed()),
        "Request complete"
    );
    result.into_response()
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(e) = source {
        if e.to_string().contains("length limit exceeded") {
            return true;
        }
        source = e.source();
    }
    err.to_string().contains("length limit exceeded")
}

fn elapsed_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
