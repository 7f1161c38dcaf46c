//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! connection engine, listener, server:
//!     → logging.rs (structured events inside per-connection `peer` spans)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (human readable or JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every connection gets a span carrying its ID and remote address
//! - Per-connection lifecycle events are logged at trace level
//! - Metrics are cheap (atomic increments) and off unless an exporter is installed

pub mod logging;
pub mod metrics;
