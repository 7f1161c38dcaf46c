//! Streaming response producers.
//!
//! # Responsibilities
//! - Define the contract between the connection and an incremental producer
//! - Provide a channel-style producer the application can feed from any thread
//!
//! # Design Decisions
//! - `Resume` is a move-only token, so a parked connection is woken at most
//!   once per `prepare` that returned `false`
//! - The connection never busy-waits on a producer; a parked stream costs
//!   nothing until resumed
//! - Waiting on a producer is not subject to the network deadline

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::session::Command;

/// Incremental response producer driven by the connection.
///
/// The connection repeatedly calls [`prepare`](Writer::prepare), transmits
/// [`data`](Writer::data), reports the transmitted amount through
/// [`consume`](Writer::consume) and stops once [`complete`](Writer::complete)
/// is true.
pub trait Writer: Send + 'static {
    /// Make up to `max_bytes` available through `data`.
    ///
    /// Returns `false` when nothing is ready yet. The writer must then keep
    /// `resume` and invoke it once more data is ready or the stream ended.
    fn prepare(&mut self, max_bytes: usize, resume: Resume) -> bool;

    /// Byte ranges ready for transmission, in order.
    fn data(&self) -> Vec<Bytes>;

    /// `n` bytes from the front of `data` were transmitted.
    fn consume(&mut self, n: usize);

    /// Whether every byte of the response has been consumed.
    fn complete(&self) -> bool;
}

/// Wakes a connection whose streaming writer had no data ready.
pub struct Resume {
    commands: mpsc::UnboundedSender<Command>,
}

impl Resume {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Re-enter the connection's streaming loop.
    ///
    /// Has no effect if the connection has already been torn down.
    pub fn resume(self) {
        let _ = self.commands.send(Command::Resume);
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

#[derive(Debug, Default)]
struct StreamState {
    chunks: VecDeque<Bytes>,
    finished: bool,
    resume: Option<Resume>,
}

fn lock(state: &Mutex<StreamState>) -> MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected producer pair.
///
/// Hand the [`StreamWriter`] to [`Session::write_stream`](crate::session::Session::write_stream)
/// and feed chunks through the [`StreamSender`].
pub fn stream() -> (StreamSender, StreamWriter) {
    let state = Arc::new(Mutex::new(StreamState::default()));
    (
        StreamSender {
            state: Arc::clone(&state),
        },
        StreamWriter {
            state,
            staged: Vec::new(),
        },
    )
}

/// Application side of a [`stream`]. Dropping it finishes the stream.
#[derive(Debug)]
pub struct StreamSender {
    state: Arc<Mutex<StreamState>>,
}

impl StreamSender {
    /// Queue a chunk for transmission. Ignored once the stream is finished.
    pub fn send(&self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        let resume = {
            let mut state = lock(&self.state);
            if state.finished || chunk.is_empty() {
                return;
            }
            state.chunks.push_back(chunk);
            state.resume.take()
        };
        if let Some(resume) = resume {
            resume.resume();
        }
    }

    /// Mark the end of the response body.
    pub fn finish(&self) {
        let resume = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.finished = true;
            state.resume.take()
        };
        if let Some(resume) = resume {
            resume.resume();
        }
    }
}

impl Drop for StreamSender {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Connection side of a [`stream`].
#[derive(Debug)]
pub struct StreamWriter {
    state: Arc<Mutex<StreamState>>,
    staged: Vec<Bytes>,
}

impl Writer for StreamWriter {
    fn prepare(&mut self, max_bytes: usize, resume: Resume) -> bool {
        if !self.staged.is_empty() {
            return true;
        }

        let mut state = lock(&self.state);
        let mut staged_len = 0;
        while staged_len < max_bytes {
            let Some(front) = state.chunks.front_mut() else {
                break;
            };
            let room = max_bytes - staged_len;
            let chunk = if front.len() <= room {
                match state.chunks.pop_front() {
                    Some(chunk) => chunk,
                    None => break,
                }
            } else {
                front.split_to(room)
            };
            staged_len += chunk.len();
            self.staged.push(chunk);
        }

        if self.staged.is_empty() && !state.finished {
            state.resume = Some(resume);
            return false;
        }
        true
    }

    fn data(&self) -> Vec<Bytes> {
        self.staged.clone()
    }

    fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.staged.first_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                self.staged.remove(0);
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }

    fn complete(&self) -> bool {
        if !self.staged.is_empty() {
            return false;
        }
        let state = lock(&self.state);
        state.finished && state.chunks.is_empty()
    }
}
