//! Request/response protocol collaborators.
//!
//! # Data Flow
//! ```text
//! bytes from transport
//!     → parser.rs (incremental framing, limits)
//!     → message.rs (Request handed to the application)
//!
//! application
//!     → response.rs (optional helper to encode a reply)
//!     → Session::write
//! ```
//!
//! # Design Decisions
//! - The connection engine depends only on the `Parser` trait
//! - `HttpParser` is the stock HTTP/1.x implementation
//! - Parse failures carry their own error type, separate from I/O errors

pub mod message;
pub mod parser;
pub mod response;

pub use message::Request;
pub use parser::{HttpParser, ParseError, Parser, ParserLimits};
pub use response::Response;
