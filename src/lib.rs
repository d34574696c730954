//! Resilient reverse proxy library.
//!
//! Circuit breakers (local or shared through a store), bulkheads and retries
//! composed per named service by [`ResilienceManager`], and a
//! [`ReverseProxy`] that forwards requests through them.

pub mod admin;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod store;

pub use config::schema::GatewayConfig;
pub use error::{ProxyError, Result, TransportError};
pub use http::{GatewayServer, ProxyRequest, ProxyResult, ReverseProxy};
pub use lifecycle::Shutdown;
pub use resilience::ResilienceManager;
