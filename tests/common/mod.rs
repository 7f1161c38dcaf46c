//! Shared utilities for connection engine tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use http_peer::config::ServerConfig;
use http_peer::{Handler, Peer, PeerError, Request, Session};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockState {
    transmits: Vec<Vec<u8>>,
    reads_completed: usize,
    stalled: bool,
    blocked_writer: Option<Waker>,
    fail_writes: bool,
    shutdown: bool,
    dropped: bool,
}

/// In-memory transport whose input is scripted by a [`MockControl`].
///
/// Every `poll_write_vectored` call that makes progress is recorded as one
/// transmit, so coalescing is observable.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    partial: Option<(Vec<u8>, usize)>,
}

/// Test-side handle of a [`MockTransport`].
pub struct MockControl {
    state: Arc<Mutex<MockState>>,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

pub fn mock_transport() -> (MockTransport, MockControl) {
    let state = Arc::new(Mutex::new(MockState::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            state: Arc::clone(&state),
            input: rx,
            partial: None,
        },
        MockControl {
            state,
            input: Some(tx),
        },
    )
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap()
}

impl MockControl {
    /// Make `bytes` available to the next read.
    pub fn send(&self, bytes: impl AsRef<[u8]>) {
        if let Some(input) = &self.input {
            input.send(bytes.as_ref().to_vec()).unwrap();
        }
    }

    /// Reads return end-of-stream once queued input is consumed.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Park every following write until [`release_writes`](Self::release_writes).
    pub fn stall_writes(&self) {
        lock(&self.state).stalled = true;
    }

    pub fn release_writes(&self) {
        let waker = {
            let mut state = lock(&self.state);
            state.stalled = false;
            state.blocked_writer.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Whether a write is parked on a stall.
    pub fn write_blocked(&self) -> bool {
        lock(&self.state).blocked_writer.is_some()
    }

    pub fn fail_writes(&self) {
        lock(&self.state).fail_writes = true;
    }

    pub fn transmits(&self) -> Vec<Vec<u8>> {
        lock(&self.state).transmits.clone()
    }

    /// Everything transmitted so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).transmits.concat()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn reads_completed(&self) -> usize {
        lock(&self.state).reads_completed
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.state).shutdown
    }

    pub fn is_dropped(&self) -> bool {
        lock(&self.state).dropped
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.partial.is_none() {
            match this.input.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    lock(&this.state).reads_completed += 1;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(chunk)) => this.partial = Some((chunk, 0)),
            }
        }

        if let Some((chunk, offset)) = this.partial.as_mut() {
            let n = buf.remaining().min(chunk.len() - *offset);
            buf.put_slice(&chunk[*offset..*offset + n]);
            *offset += n;
            if *offset == chunk.len() {
                this.partial = None;
            }
        }
        lock(&this.state).reads_completed += 1;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_vectored(cx, &[io::IoSlice::new(buf)])
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let mut state = lock(&self.state);
        if state.stalled {
            state.blocked_writer = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if state.fail_writes {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let transmit: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
        let n = transmit.len();
        state.transmits.push(transmit);
        Poll::Ready(Ok(n))
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        lock(&self.state).shutdown = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.dropped = true;
        }
    }
}

/// How a connection ended, as seen by `Handler::on_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Clean,
    Io,
    Timeout,
    IncompleteRequest,
    Parse,
    StalledWriter,
}

impl From<Option<&PeerError>> for CloseReason {
    fn from(error: Option<&PeerError>) -> Self {
        match error {
            None => CloseReason::Clean,
            Some(PeerError::Io(_)) => CloseReason::Io,
            Some(PeerError::Timeout(_)) => CloseReason::Timeout,
            Some(PeerError::IncompleteRequest) => CloseReason::IncompleteRequest,
            Some(PeerError::Parse(_)) => CloseReason::Parse,
            Some(PeerError::StalledWriter) => CloseReason::StalledWriter,
        }
    }
}

type Behaviour = Box<dyn Fn(&Session) + Send + Sync>;

/// Handler that records what it sees and runs a scripted reaction per request.
pub struct RecordingHandler {
    behaviour: Behaviour,
    requests: Mutex<Vec<Arc<Request>>>,
    sessions: Mutex<Vec<Session>>,
    closed: mpsc::UnboundedSender<CloseReason>,
}

impl RecordingHandler {
    pub fn new(
        behaviour: impl Fn(&Session) + Send + Sync + 'static,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CloseReason>) {
        let (closed, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            behaviour: Box::new(behaviour),
            requests: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            closed,
        });
        (handler, rx)
    }

    /// Handler that replies `reply` to every request and completes it.
    pub fn replying(reply: &'static [u8]) -> (Arc<Self>, mpsc::UnboundedReceiver<CloseReason>) {
        Self::new(move |session| {
            session.write(reply);
            session.complete();
        })
    }

    pub fn requests(&self) -> Vec<Arc<Request>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Session> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

impl Handler for RecordingHandler {
    fn on_request(&self, session: &Session) {
        if let Some(request) = session.request() {
            self.requests.lock().unwrap().push(request);
        }
        self.sessions.lock().unwrap().push(session.clone());
        (self.behaviour)(session);
    }

    fn on_close(&self, _session: &Session, error: Option<&PeerError>) {
        let _ = self.closed.send(CloseReason::from(error));
    }
}

pub fn remote_addr() -> SocketAddr {
    "192.0.2.7:40000".parse().unwrap()
}

/// Run a connection engine over `transport` on its own task.
pub fn spawn_peer(
    transport: MockTransport,
    pre_read: &[u8],
    handler: Arc<RecordingHandler>,
) -> (Session, JoinHandle<()>) {
    spawn_peer_with(transport, pre_read, handler, ServerConfig::default())
}

pub fn spawn_peer_with(
    transport: MockTransport,
    pre_read: &[u8],
    handler: Arc<RecordingHandler>,
    config: ServerConfig,
) -> (Session, JoinHandle<()>) {
    let peer: Peer<MockTransport> =
        Peer::new(transport, remote_addr(), pre_read, Arc::new(config), handler);
    let session = peer.session().clone();
    (session, tokio::spawn(peer.run()))
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

/// Wait for a spawned engine to finish.
pub async fn finished(task: JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("connection did not close")
        .expect("connection task panicked");
}
