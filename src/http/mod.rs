//! HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → server.rs (axum router, request id, tracing, timeout)
//!     → routing (longest prefix picks upstream and service)
//!     → request.rs (buffer body, split query)
//!     → proxy.rs (direct call or service client)
//!         → client.rs (resilience pipeline)
//!         → transport.rs (hyper client)
//!     → response.rs (ProxyResult, or the 503 envelope)
//!     → Send to client
//! ```

pub mod client;
pub mod headers;
pub mod proxy;
pub mod request;
pub mod response;
pub mod server;
pub mod transport;

pub use client::{ClientFallback, ResilientClient};
pub use headers::{sanitize_headers, ForwardingIdentity};
pub use proxy::{ProxyStats, ReverseProxy};
pub use request::{request_id, ProxyRequest, X_REQUEST_ID};
pub use response::{ProxyBody, ProxyResult};
pub use server::{AppState, GatewayServer};
pub use transport::{HttpTransport, HyperTransport, OutboundRequest, TransportResponse};
