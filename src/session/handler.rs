//! Application callbacks.

use std::net::SocketAddr;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};

use crate::error::PeerError;
use crate::proto::{ParseError, Response};
use crate::session::Session;

/// Application logic attached to every connection of a server.
///
/// Callbacks run on the connection's task and must not block. Replies are
/// produced through the [`Session`] handle, either inline or later from any
/// thread.
pub trait Handler: Send + Sync + 'static {
    /// Decide whether to serve a freshly accepted connection.
    fn on_accept(&self, remote_addr: SocketAddr) -> bool {
        let _ = remote_addr;
        true
    }

    /// A complete request is available through [`Session::request`].
    ///
    /// The connection reads nothing further until the application calls
    /// [`Session::complete`], [`Session::write_stream`] or [`Session::close`].
    fn on_request(&self, session: &Session);

    /// The request bytes could not be framed.
    ///
    /// Anything written here is transmitted before the connection closes.
    /// The default reply is `400 Bad Request`.
    fn on_parse_error(&self, session: &Session, error: &ParseError) {
        let response = Response::new(StatusCode::BAD_REQUEST)
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .body(format!("{error}\n"));
        session.write(response.encode(false));
    }

    /// The connection is gone. Called exactly once, with the first failure
    /// recorded during its lifetime, if any.
    fn on_close(&self, session: &Session, error: Option<&PeerError>) {
        let _ = (session, error);
    }
}
