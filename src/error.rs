//! Connection error definitions.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::proto::ParseError;

/// Reason a connection was torn down.
///
/// At most one is recorded per connection; it is reported to
/// [`Handler::on_close`](crate::session::Handler::on_close).
#[derive(Debug, Error)]
pub enum PeerError {
    /// Transport read, write or shutdown failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// No network progress before the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed its side in the middle of a request.
    #[error("incomplete request")]
    IncompleteRequest,

    /// The request could not be framed.
    #[error("bad request: {0}")]
    Parse(#[from] ParseError),

    /// A streaming writer reported data ready but exposed none.
    #[error("streaming writer prepared no data")]
    StalledWriter,
}

impl PeerError {
    /// Whether this is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::Timeout(_))
    }

    /// Whether this is a protocol framing failure rather than a transport one.
    pub fn is_parse(&self) -> bool {
        matches!(self, PeerError::Parse(_))
    }
}
