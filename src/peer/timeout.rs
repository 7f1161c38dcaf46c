//! Deadline guard for network waits.
//!
//! # Responsibilities
//! - Arm a fixed deadline before the connection suspends on the network
//! - Cancel it as soon as no network operation remains outstanding
//! - Turn a genuine expiry into a timeout error
//!
//! # Design Decisions
//! - Single-shot: firing disarms the guard
//! - An expiry observed after cancellation is a benign race and yields nothing
//! - Waiting on the application (handler or streaming producer) is never timed

use std::future;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::error::PeerError;

/// One deadline timer per connection.
#[derive(Debug)]
pub struct TimeoutGuard {
    duration: Duration,
    deadline: Option<Instant>,
}

impl TimeoutGuard {
    /// Create a disarmed guard that expires `duration` after each arming.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: None,
        }
    }

    /// (Re)start the deadline from now.
    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.duration);
    }

    /// Cancel the deadline.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes; never resolves while disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    }

    /// Consume an expiry.
    ///
    /// Returns the timeout error if the guard was still armed, or `None` when
    /// the wait it guarded already completed.
    pub fn fire(&mut self) -> Option<PeerError> {
        self.deadline
            .take()
            .map(|_| PeerError::Timeout(self.duration))
    }
}
