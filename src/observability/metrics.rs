//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): forwarded requests by service, status
//! - `gateway_request_duration_seconds` (histogram): forward latency by service
//! - `gateway_breaker_transitions_total` (counter): breaker state changes
//! - `gateway_bulkhead_rejections_total` (counter): capacity rejections
//! - `gateway_retries_total` (counter): scheduled retries
//!
//! Without an installed recorder every call here is a no-op.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

pub fn record_request(service: &str, status: u16, latency: Duration) {
    counter!(
        "gateway_requests_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds", "service" => service.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_breaker_transition(name: &str, to: &str) {
    counter!(
        "gateway_breaker_transitions_total",
        "name" => name.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_bulkhead_rejection(name: &str) {
    counter!("gateway_bulkhead_rejections_total", "name" => name.to_string()).increment(1);
}

pub fn record_retry(name: &str) {
    counter!("gateway_retries_total", "name" => name.to_string()).increment(1);
}
