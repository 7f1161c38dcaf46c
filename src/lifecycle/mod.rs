//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → Server stops accepting → live connections close gracefully
//!             → Server::run returns once the registry is empty
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - A second signal forces exit

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
