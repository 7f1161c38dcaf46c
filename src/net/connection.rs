//! Connection identity, lifecycle state and registry.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Name the lifecycle states a connection moves through
//! - Track live sessions so the server can close and drain them
//!
//! # Connection States
//! ```text
//! Reading ──request──▶ Dispatched ──complete──▶ Reading
//!                          │
//!                          └──write_stream──▶ Streaming ──done──▶ Reading
//!
//! any state ──close(graceful)──▶ Draining ──shutdown──▶ Closed
//! any state ──failure / close(abort)──────────────────▶ Closed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::watch;

use crate::session::Session;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Waiting for or parsing the next request.
    Reading = 0,
    /// A request was handed to the application; reads are paused.
    Dispatched = 1,
    /// A streaming writer is producing the response.
    Streaming = 2,
    /// Flushing pending writes before shutting the transport down.
    Draining = 3,
    /// Torn down; no further I/O happens.
    Closed = 4,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Reading,
            1 => ConnectionState::Dispatched,
            2 => ConnectionState::Streaming,
            3 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the connection still performs I/O.
    pub fn is_open(self) -> bool {
        self != ConnectionState::Closed
    }
}

#[derive(Debug)]
struct RegistryInner {
    sessions: DashMap<ConnectionId, Session>,
    active: watch::Sender<usize>,
    admitting: watch::Sender<usize>,
    /// Set once by `close_all`; holds whether the close was graceful.
    closing: OnceLock<bool>,
}

/// Live sessions of a server, keyed by connection ID.
///
/// Entries are owned by a [`Registration`] guard held by the connection task,
/// so a session leaves the registry exactly when its task ends.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (active, _) = watch::channel(0);
        let (admitting, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                active,
                admitting,
                closing: OnceLock::new(),
            }),
        }
    }

    /// Record a live session. Returns a guard that removes it on drop.
    pub fn register(&self, session: Session) -> Registration {
        let id = session.id();
        self.inner.sessions.insert(id, session);
        self.inner.active.send_modify(|count| *count += 1);
        crate::observability::metrics::record_active_connections(self.active_count());
        Registration {
            registry: self.clone(),
            id,
        }
    }

    /// Reserve a place for a connection that has no session yet.
    ///
    /// [`wait_idle`](Self::wait_idle) waits for outstanding admissions, and a
    /// session registered through one after [`close_all`](Self::close_all)
    /// is closed right away.
    pub fn admit(&self) -> Admission {
        self.inner.admitting.send_modify(|count| *count += 1);
        Admission {
            registry: self.clone(),
        }
    }

    /// Whether `close_all` has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.get().is_some()
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Look up a live session.
    pub fn get(&self, id: ConnectionId) -> Option<Session> {
        self.inner.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Ask every live session to close, and every session admitted later.
    pub fn close_all(&self, graceful: bool) {
        let _ = self.inner.closing.set(graceful);
        for entry in self.inner.sessions.iter() {
            entry.value().close(graceful);
        }
        tracing::debug!(
            sessions = self.inner.sessions.len(),
            graceful,
            "Close requested for all connections"
        );
    }

    /// Wait until every admitted connection and registered session has ended.
    pub async fn wait_idle(&self) {
        let mut admitting = self.inner.admitting.subscribe();
        let _ = admitting.wait_for(|count| *count == 0).await;
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    fn remove(&self, id: ConnectionId) {
        if self.inner.sessions.remove(&id).is_some() {
            self.inner.active.send_modify(|count| *count -= 1);
            crate::observability::metrics::record_active_connections(self.active_count());
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection accepted but not yet registered.
#[derive(Debug)]
pub struct Admission {
    registry: ConnectionRegistry,
}

impl Admission {
    /// Register the connection's session.
    ///
    /// If the registry is already closing, the session is asked to close
    /// the same way the others were.
    pub fn register(self, session: Session) -> Registration {
        let registration = self.registry.register(session.clone());
        if let Some(&graceful) = self.registry.inner.closing.get() {
            tracing::debug!(connection_id = %session.id(), "Closing connection admitted during shutdown");
            session.close(graceful);
        }
        registration
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry.inner.admitting.send_modify(|count| *count -= 1);
    }
}

/// Guard that keeps a session registered.
#[derive(Debug)]
pub struct Registration {
    registry: ConnectionRegistry,
    id: ConnectionId,
}

impl Registration {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        tracing::trace!(connection_id = %self.id, "Connection unregistered");
    }
}
