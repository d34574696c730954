use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::http::proxy::ProxyStats;
use crate::http::server::AppState;
use crate::resilience::CircuitState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub routes: usize,
    pub unhealthy: Vec<String>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let unhealthy = state.proxy.unhealthy_upstreams().await;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if unhealthy.is_empty() { "operational" } else { "degraded" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        routes: state.routes.routes().len(),
        unhealthy,
    })
}

pub async fn get_stats(State(state): State<AppState>) -> Json<ProxyStats> {
    Json(state.proxy.stats().await)
}

pub async fn get_breakers(State(state): State<AppState>) -> Json<BTreeMap<String, CircuitState>> {
    Json(state.proxy.breaker_states().await)
}

pub async fn get_unhealthy(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.proxy.unhealthy_upstreams().await)
}

pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if state.proxy.reset_breaker(&name).await {
        tracing::info!(service = %name, "Breaker reset via admin API");
        (StatusCode::OK, Json(json!({ "reset": name })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Unknown service", "service": name })),
        )
    }
}

pub async fn reset_all_breakers(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.proxy.reset_all_breakers().await;
    tracing::info!("All breakers reset via admin API");
    Json(json!({ "reset": "all" }))
}
