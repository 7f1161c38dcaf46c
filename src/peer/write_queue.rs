//! Queue-and-coalesce buffering for response bytes.
//!
//! # Responsibilities
//! - Copy caller bytes immediately so the caller's buffer can be reused
//! - Tell the caller whether its write must wake the connection
//! - Hand the connection everything queued since the last transmit, as one batch
//!
//! # Design Decisions
//! - Two lists behind one lock: `pending` (queued since the current transmit
//!   started) and `in_flight` (being transmitted)
//! - A transmit is active exactly when `in_flight` is non-empty
//! - Only the connection task swaps the lists; any thread may append

use std::io::IoSlice;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

/// An owned copy of enqueued bytes and how much of it has been transmitted.
#[derive(Debug, Clone)]
pub struct Segment {
    data: Bytes,
    used: usize,
}

impl Segment {
    /// Copy `data` into a new segment.
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            used: 0,
        }
    }

    /// Bytes still to be transmitted.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.used..]
    }

    /// Total size of the segment.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the segment holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn advance(&mut self, n: usize) {
        self.used = (self.used + n).min(self.data.len());
    }
}

/// A drained set of segments for one transmit, in enqueue order.
#[derive(Debug)]
pub struct Batch {
    segments: Vec<Segment>,
}

impl Batch {
    /// Total bytes not yet transmitted.
    pub fn remaining(&self) -> usize {
        self.segments.iter().map(|s| s.remaining().len()).sum()
    }

    /// Whether every byte has been transmitted.
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Vectored view of the untransmitted bytes.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segments
            .iter()
            .map(Segment::remaining)
            .filter(|rest| !rest.is_empty())
            .map(IoSlice::new)
            .collect()
    }

    /// Mark `n` more bytes as transmitted, front to back.
    pub fn advance(&mut self, mut n: usize) {
        for segment in &mut self.segments {
            if n == 0 {
                break;
            }
            let take = segment.remaining().len().min(n);
            segment.advance(take);
            n -= take;
        }
    }

    /// Number of logical writes coalesced into this batch.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the batch holds no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Default)]
struct Lists {
    pending: Vec<Segment>,
    in_flight: Vec<Segment>,
}

/// Mutex-guarded pending/in-flight segment lists.
#[derive(Debug, Default)]
pub struct WriteQueue {
    lists: Mutex<Lists>,
}

impl WriteQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy `data` onto the pending list.
    ///
    /// Returns `true` when this append must start a transmit: nothing is in
    /// flight and nothing else was already waiting to go. Empty writes are
    /// ignored and never trigger.
    pub fn enqueue(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut lists = self.lock();
        lists.pending.push(Segment::new(data));
        lists.pending.len() == 1 && lists.in_flight.is_empty()
    }

    /// Move everything pending into flight.
    ///
    /// Returns `None` when a transmit is already active or nothing is pending.
    pub fn begin_flush(&self) -> Option<Batch> {
        let mut lists = self.lock();
        if !lists.in_flight.is_empty() || lists.pending.is_empty() {
            return None;
        }
        let Lists { pending, in_flight } = &mut *lists;
        mem::swap(pending, in_flight);
        Some(Batch {
            segments: in_flight.clone(),
        })
    }

    /// Retire the active transmit and start the next one if anything was
    /// queued meanwhile.
    pub fn finish_flush(&self) -> Option<Batch> {
        let mut lists = self.lock();
        lists.in_flight.clear();
        if lists.pending.is_empty() {
            return None;
        }
        let Lists { pending, in_flight } = &mut *lists;
        mem::swap(pending, in_flight);
        Some(Batch {
            segments: in_flight.clone(),
        })
    }

    /// Whether a transmit is active.
    pub fn is_flushing(&self) -> bool {
        !self.lock().in_flight.is_empty()
    }

    /// Whether nothing is pending and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        let lists = self.lock();
        lists.pending.is_empty() && lists.in_flight.is_empty()
    }

    /// Drop everything queued or in flight.
    pub fn clear(&self) {
        let mut lists = self.lock();
        lists.pending.clear();
        lists.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(batch: &Batch) -> Vec<u8> {
        batch.io_slices().iter().flat_map(|s| s.to_vec()).collect()
    }

    #[test]
    fn first_write_triggers() {
        let queue = WriteQueue::new();
        assert!(queue.enqueue(b"a"));
        assert!(!queue.enqueue(b"b"));
    }

    #[test]
    fn empty_write_is_noop() {
        let queue = WriteQueue::new();
        assert!(!queue.enqueue(b""));
        assert!(queue.is_idle());
        assert!(queue.begin_flush().is_none());
    }

    #[test]
    fn writes_during_flight_coalesce_in_order() {
        let queue = WriteQueue::new();
        assert!(queue.enqueue(b"head"));
        let first = queue.begin_flush().unwrap();
        assert_eq!(concat(&first), b"head");
        assert!(queue.is_flushing());

        assert!(!queue.enqueue(b"one"));
        assert!(!queue.enqueue(b"two"));
        assert!(queue.begin_flush().is_none());

        let second = queue.finish_flush().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(concat(&second), b"onetwo");

        assert!(queue.finish_flush().is_none());
        assert!(queue.is_idle());
        assert!(queue.enqueue(b"three"));
    }

    #[test]
    fn batch_tracks_partial_progress() {
        let queue = WriteQueue::new();
        queue.enqueue(b"abc");
        queue.enqueue(b"defg");
        let mut batch = queue.begin_flush().unwrap();
        assert_eq!(batch.remaining(), 7);

        batch.advance(4);
        assert_eq!(concat(&batch), b"efg");
        assert_eq!(batch.io_slices().len(), 1);

        batch.advance(3);
        assert!(batch.is_done());
    }

    #[test]
    fn concurrent_writers_preserve_per_thread_order() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(WriteQueue::new());
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..50u8 {
                        queue.enqueue(&[t, i]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let batch = queue.begin_flush().unwrap();
        let bytes = concat(&batch);
        assert_eq!(bytes.len(), 400);
        for t in 0..4u8 {
            let seen: Vec<u8> = bytes.chunks(2).filter(|p| p[0] == t).map(|p| p[1]).collect();
            assert_eq!(seen, (0..50u8).collect::<Vec<_>>());
        }
    }
}
