//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proto::ParserLimits;

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection limits, sniffing).
    pub listener: ListenerConfig,

    /// Per-connection engine settings.
    pub connection: ConnectionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// How long to wait for the first bytes of a new connection, in milliseconds.
    pub sniff_timeout_ms: u64,

    /// Refuse connections that open with a TLS handshake record.
    pub reject_tls: bool,
}

impl ListenerConfig {
    /// Sniff timeout as a `Duration`.
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            sniff_timeout_ms: 5_000,
            reject_tls: true,
        }
    }
}

/// Settings applied to every accepted connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound on a single transport read, in bytes.
    pub read_chunk_size: usize,

    /// Upper bound passed to a streaming writer's `prepare`, in bytes.
    pub write_chunk_size: usize,

    /// Deadline for any single network wait, in seconds.
    pub timeout_secs: u64,

    /// Largest request line plus headers, in bytes.
    pub max_head_size: usize,

    /// Largest number of request header fields.
    pub max_headers: usize,

    /// Largest request body, in bytes.
    pub max_body_size: usize,
}

impl ConnectionConfig {
    /// Network deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Limits handed to each request parser.
    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_head_size: self.max_head_size,
            max_headers: self.max_headers,
            max_body_size: self.max_body_size,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let limits = ParserLimits::default();
        Self {
            read_chunk_size: 4 * 1024,
            write_chunk_size: 4 * 1024,
            timeout_secs: 30,
            max_head_size: limits.max_head_size,
            max_headers: limits.max_headers,
            max_body_size: limits.max_body_size,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines instead of the human readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
