//! Application-facing connection handle.
//!
//! # Data Flow
//! ```text
//! connection task ──on_request──▶ Handler
//!                                    │
//!                                    ▼
//!                        Session (cloneable, any thread)
//!                          write / write_stream / complete / close
//!                                    │
//!                   WriteQueue + command channel
//!                                    │
//!                                    ▼
//!                           connection task
//! ```
//!
//! # Design Decisions
//! - Every operation posts to the connection task; nothing touches the
//!   transport from the caller's thread
//! - `write` copies into the shared queue first, so only the write that
//!   starts a transmit costs a wake-up
//! - Lifecycle state and counters are mirrored into atomics for observers

pub mod handler;
pub mod writer;

pub use handler::Handler;
pub use writer::{stream, Resume, StreamSender, StreamWriter, Writer};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::Span;

use crate::config::{ListenerConfig, ServerConfig};
use crate::net::connection::{ConnectionId, ConnectionState};
use crate::peer::write_queue::WriteQueue;
use crate::proto::Request;

/// Work posted to a connection task.
pub(crate) enum Command {
    /// The write queue went from idle to non-empty.
    Flush,
    /// The buffered response is finished.
    Complete,
    /// Hand the response body to a streaming writer.
    Stream {
        writer: Box<dyn Writer>,
        keep_alive: bool,
    },
    /// A parked streaming writer has data again.
    Resume,
    /// Close the connection, after pending writes when `graceful`.
    Close { graceful: bool },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Flush => f.write_str("Flush"),
            Command::Complete => f.write_str("Complete"),
            Command::Stream { keep_alive, .. } => f
                .debug_struct("Stream")
                .field("keep_alive", keep_alive)
                .finish_non_exhaustive(),
            Command::Resume => f.write_str("Resume"),
            Command::Close { graceful } => {
                f.debug_struct("Close").field("graceful", graceful).finish()
            }
        }
    }
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Requests dispatched to the handler.
    pub requests: u64,
    /// Bytes received from the transport, excluding pre-read bytes.
    pub bytes_in: u64,
    /// Bytes transmitted to the transport.
    pub bytes_out: u64,
}

struct Shared {
    id: ConnectionId,
    remote_addr: SocketAddr,
    config: Arc<ServerConfig>,
    span: Span,
    queue: WriteQueue,
    commands: mpsc::UnboundedSender<Command>,
    request: Mutex<Option<Arc<Request>>>,
    state: AtomicU8,
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Handle to one connection, shared between its task and the application.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        config: Arc<ServerConfig>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let span = tracing::debug_span!("peer", id = %id, remote = %remote_addr);
        Self {
            shared: Arc::new(Shared {
                id,
                remote_addr,
                config,
                span,
                queue: WriteQueue::new(),
                commands,
                request: Mutex::new(None),
                state: AtomicU8::new(ConnectionState::Reading as u8),
                requests: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
            }),
        }
    }

    /// Identifier used in logs.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Address of the remote end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    /// Settings of the listener that accepted this connection.
    pub fn listener_config(&self) -> &ListenerConfig {
        &self.shared.config.listener
    }

    /// Full server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Tracing span every event of this connection is recorded in.
    pub fn span(&self) -> &Span {
        &self.shared.span
    }

    /// The request currently being served, if any.
    pub fn request(&self) -> Option<Arc<Request>> {
        self.lock_request().clone()
    }

    /// Body of the current request; empty when there is none.
    pub fn body(&self) -> Bytes {
        self.lock_request()
            .as_ref()
            .map(|request| request.body().clone())
            .unwrap_or_default()
    }

    /// Queue bytes for transmission.
    ///
    /// The bytes are copied before returning. Writes from any thread are
    /// transmitted in the order they were made; writes made while a transmit
    /// is in progress are coalesced into the next one. Empty writes do
    /// nothing.
    pub fn write(&self, data: impl AsRef<[u8]>) {
        if self.shared.queue.enqueue(data.as_ref()) {
            let _ = self.shared.commands.send(Command::Flush);
        }
    }

    /// Produce the rest of the response through `writer`.
    ///
    /// Bytes already passed to [`write`](Session::write) go out first. When
    /// `keep_alive` is false the connection closes once the writer completes.
    /// Streaming replaces [`complete`](Session::complete) for this request.
    pub fn write_stream<W: Writer>(&self, writer: W, keep_alive: bool) {
        let _ = self.shared.commands.send(Command::Stream {
            writer: Box::new(writer),
            keep_alive,
        });
    }

    /// Mark the buffered response finished.
    ///
    /// Once pending writes drain, the connection reads the next request.
    pub fn complete(&self) {
        let _ = self.shared.commands.send(Command::Complete);
    }

    /// Close the connection.
    ///
    /// A graceful close transmits everything already written before shutting
    /// the transport down; otherwise the transport is dropped at once.
    pub fn close(&self, graceful: bool) {
        let _ = self.shared.commands.send(Command::Close { graceful });
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Snapshot of the connection's counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            requests: self.shared.requests.load(Ordering::Relaxed),
            bytes_in: self.shared.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.shared.bytes_out.load(Ordering::Relaxed),
        }
    }

    fn lock_request(&self) -> MutexGuard<'_, Option<Arc<Request>>> {
        self.shared
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn queue(&self) -> &WriteQueue {
        &self.shared.queue
    }

    pub(crate) fn resume_token(&self) -> Resume {
        Resume::new(self.shared.commands.clone())
    }

    pub(crate) fn set_request(&self, request: Option<Arc<Request>>) {
        *self.lock_request() = request;
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn record_request(&self) {
        self.shared.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_in(&self, n: usize) {
        self.shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_out(&self, n: usize) {
        self.shared.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}
