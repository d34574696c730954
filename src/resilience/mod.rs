//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to an upstream:
//!     → bulkhead.rs (bounded concurrency, FIFO queue)
//!     → circuit_breaker.rs / distributed.rs (fail fast while the upstream is down)
//!     → retries.rs + backoff.rs (retry transient failures with jittered backoff)
//!     → stats.rs, events.rs (counts, latency and observer notifications)
//! ```
//!
//! `manager.rs` composes these into one pipeline per name.
//!
//! # Design Decisions
//! - Every external call has a deadline
//! - Rejections never consume retry budget
//! - Breaker state can live in a shared store for fleet-wide consistency
//! - No global registries; the manager is constructed once and shared

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod distributed;
pub mod events;
pub mod manager;
pub mod presets;
pub mod retries;
pub mod state;
pub mod stats;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadRegistry, BulkheadState};
pub use circuit_breaker::{Breaker, BreakerConfig, CircuitBreaker, CircuitRecord, CircuitState};
pub use distributed::{DistributedCircuitBreaker, TransitionMessage};
pub use events::{CallCounts, EventBus, EventKind, HandlerError, HandlerId, ResilienceEvent};
pub use manager::{Pipeline, ResilienceManager};
pub use presets::PipelineOptions;
pub use retries::{RetryExecutor, RetryPolicy};
pub use stats::{LatencySummary, PipelineStats};
