//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route Compilation (at startup):
//!     RouteConfig[] → normalize prefixes → sort longest first → RouteTable
//!
//! Incoming Request (path)
//!     → router.rs (longest matching prefix)
//!     → Return: RouteMatch (upstream, service, stripped path) or None
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route

pub mod router;

pub use router::{Route, RouteMatch, RouteTable};
