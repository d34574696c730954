//! Resilient reverse proxy.
//!
//! ```text
//!   client ──▶ axum server ──▶ route table ──▶ ReverseProxy
//!                                                 │
//!                         ┌───────────────────────┴──────────────┐
//!                         ▼                                      ▼
//!                  direct call (timeout)            ResilientClient (service)
//!                                                         │
//!                                  bulkhead ─▶ breaker ─▶ retry ─▶ per-attempt timeout
//!                                                         │
//!                                                         ▼
//!                                                      upstream
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use resilient_proxy::config::{load_config, GatewayConfig};
use resilient_proxy::http::{GatewayServer, HyperTransport, ReverseProxy};
use resilient_proxy::observability::{logging, metrics};
use resilient_proxy::routing::RouteTable;

#[derive(Parser)]
#[command(name = "resilient-proxy")]
#[command(about = "Reverse proxy with circuit breakers, bulkheads and retries", long_about = None)]
struct Args {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long, env = "RESILIENT_PROXY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resilient-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        store = config.store.enabled,
        admin = config.admin.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let transport = Arc::new(HyperTransport::new());
    let proxy = Arc::new(ReverseProxy::from_config(&config, transport).await?);
    let routes = RouteTable::from_config(&config.routes);
    if routes.is_empty() {
        tracing::warn!("No routes configured; every request will get 404");
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    GatewayServer::new(&config, proxy, routes).run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
