//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (floors and route checks)
//!     → GatewayConfig (validated, immutable)
//!     → resolved once into BreakerConfig / RetryPolicy / BulkheadConfig
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BreakerSettings, BulkheadSettings, GatewayConfig, ListenerConfig,
    ObservabilityConfig, ProxySettings, RetrySettings, RouteConfig, StoreSettings,
};
