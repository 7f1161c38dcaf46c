//! Byte-stream transport abstraction.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything a connection can run over: TCP, TLS, Unix sockets, in-memory
/// pipes.
///
/// The connection splits the transport so that one read and one write can
/// be outstanding at the same time. Dropping both halves closes it.
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + 'static {}
