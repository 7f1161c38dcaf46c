//! Asynchronous HTTP/1.x connection engine.
//!
//! Each accepted byte stream is served by a [`Peer`]: it reads and frames
//! requests, hands each one to a [`Handler`], and transmits whatever the
//! application writes through the connection's [`Session`], keeping the
//! connection alive between requests until either side closes it.

// Core subsystems
pub mod config;
pub mod error;
pub mod net;
pub mod peer;
pub mod proto;
pub mod session;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ServerConfig;
pub use error::PeerError;
pub use lifecycle::Shutdown;
pub use net::connection::{ConnectionId, ConnectionRegistry, ConnectionState};
pub use net::listener::Listener;
pub use net::server::Server;
pub use net::transport::Transport;
pub use peer::Peer;
pub use proto::{HttpParser, ParseError, Parser, ParserLimits, Request, Response};
pub use session::{stream, Handler, Resume, Session, SessionStats, StreamSender, StreamWriter, Writer};
