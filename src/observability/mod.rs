//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Resilience pipelines and the proxy produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, histograms)
//!     → ResilienceEvent handlers (resilience::events)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields, never interpolated strings, for machine parsing
//! - Metrics go through the `metrics` facade; exporter is optional

pub mod logging;
pub mod metrics;
