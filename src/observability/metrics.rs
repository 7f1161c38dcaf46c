//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define connection engine metrics
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `peer_connections_total` (counter): connections handed to an engine
//! - `peer_requests_total` (counter): requests dispatched to handlers
//! - `peer_bytes_in_total` / `peer_bytes_out_total` (counters): transport bytes
//! - `peer_failures_total` (counter): first failure per connection, by `what`
//! - `peer_active_connections` (gauge): registered live connections
//!
//! # Design Decisions
//! - Recording without an installed exporter is a no-op, so library users and
//!   tests pay nothing
//! - `what` labels are static strings: read, write, writer, timer, shutdown, parse

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Count a connection handed to an engine.
pub fn record_connection_opened() {
    counter!("peer_connections_total").increment(1);
}

/// Set the live connection gauge.
pub fn record_active_connections(count: usize) {
    gauge!("peer_active_connections").set(count as f64);
}

/// Count a request dispatched to a handler.
pub fn record_request() {
    counter!("peer_requests_total").increment(1);
}

/// Count bytes read from a transport.
pub fn record_bytes_in(n: usize) {
    counter!("peer_bytes_in_total").increment(n as u64);
}

/// Count bytes written to a transport.
pub fn record_bytes_out(n: usize) {
    counter!("peer_bytes_out_total").increment(n as u64);
}

/// Count a connection's first failure, labelled by the operation that failed.
pub fn record_failure(what: &'static str) {
    counter!("peer_failures_total", "what" => what).increment(1);
}
