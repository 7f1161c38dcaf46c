//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits, first-byte sniffing)
//!     → server.rs (engine per connection, graceful drain)
//!     → connection.rs (IDs, lifecycle states, live-session registry)
//!
//! Any other byte stream
//!     → transport.rs (blanket trait over AsyncRead + AsyncWrite)
//!     → Peer::new directly
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection is registered for graceful shutdown
//! - TLS is not terminated here; TLS handshakes can be refused early

pub mod connection;
pub mod listener;
pub mod server;
pub mod transport;
