//! Per-connection request multiplexer.
//!
//! Correlates in-flight requests to pending response slots by stream id.
//! All table operations are O(1). Each slot resolves exactly once: with the
//! response frame, with an application error carried in that frame, or with
//! `ConnectionLost` when the connection dies. A second resolution attempt
//! for the same id is an internal-invariant violation, not a normal error.
//!
//! Cancellation removes the pending slot but keeps the stream id leased
//! until the server's response eventually arrives, so a late response can
//! never complete an unrelated request that reused the id. Such late
//! responses are counted as expected orphans, separately from protocol
//! violations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{DriverError, Result};
use crate::frame::Frame;
use crate::stream::StreamIdAllocator;

/// How a response frame was consumed by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// A pending slot was completed.
    Completed,
    /// The slot was cancelled earlier; the response was discarded and the
    /// stream id returned to the free set.
    ExpectedOrphan,
}

struct MuxInner {
    alloc: StreamIdAllocator,
    pending: HashMap<i16, oneshot::Sender<Result<Frame>>>,
    cancelled: HashSet<i16>,
}

/// Pending-request table plus stream-id allocator for one connection.
pub struct RequestMultiplexer {
    inner: Mutex<MuxInner>,
    in_flight: AtomicUsize,
    orphaned: AtomicU64,
}

impl RequestMultiplexer {
    /// Creates a table bounded to `max_inflight` concurrent requests.
    pub fn new(max_inflight: usize) -> Self {
        Self {
            inner: Mutex::new(MuxInner {
                alloc: StreamIdAllocator::new(max_inflight),
                pending: HashMap::new(),
                cancelled: HashSet::new(),
            }),
            in_flight: AtomicUsize::new(0),
            orphaned: AtomicU64::new(0),
        }
    }

    /// Leases a stream id and registers a pending slot for it.
    ///
    /// Returns `None` when all ids are leased; the caller must treat this
    /// as backpressure and queue or reject, never crash.
    pub fn register(&self) -> Option<(i16, oneshot::Receiver<Result<Frame>>)> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc.acquire()?;
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some((id, rx))
    }

    /// Resolves the slot for `stream` with `result`.
    ///
    /// An id that is neither pending nor cancelled means the peer invented
    /// a correlation id; that is a protocol violation and the connection
    /// must be closed.
    pub fn resolve(&self, stream: i16, result: Result<Frame>) -> Result<ResolveOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.pending.remove(&stream) {
            inner.alloc.release(stream)?;
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            drop(inner);
            let _ = tx.send(result);
            return Ok(ResolveOutcome::Completed);
        }
        if inner.cancelled.remove(&stream) {
            inner.alloc.release(stream)?;
            self.orphaned.fetch_add(1, Ordering::Relaxed);
            return Ok(ResolveOutcome::ExpectedOrphan);
        }
        Err(DriverError::ProtocolViolation {
            reason: format!("response for unknown stream id {stream}"),
        })
    }

    /// Cancels the pending slot for `stream` before resolution.
    ///
    /// The already-written request frame cannot be unsent; the id stays
    /// leased until the late response arrives and is discarded. Returns
    /// false if the slot was already resolved or cancelled.
    pub fn cancel(&self, stream: i16) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.remove(&stream).is_none() {
            return false;
        }
        inner.cancelled.insert(stream);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Drops a slot whose request frame was never written to the socket.
    ///
    /// Unlike [`cancel`](Self::cancel) the id is released immediately: no
    /// response can ever arrive for a frame that never left the client.
    pub fn discard_unsent(&self, stream: i16) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.remove(&stream).is_none() {
            return Err(DriverError::InvariantViolation {
                reason: format!("discard of stream id {stream} with no pending slot"),
            });
        }
        inner.alloc.release(stream)?;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resolves every pending slot with `ConnectionLost` and clears all
    /// leases. Returns how many slots were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let drained: Vec<_> = inner.pending.drain().collect();
        inner.cancelled.clear();
        inner.alloc.reset();
        self.in_flight.store(0, Ordering::Relaxed);
        drop(inner);

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(DriverError::ConnectionLost {
                reason: reason.to_string(),
            }));
        }
        count
    }

    /// Requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Late responses discarded after cancellation.
    pub fn orphaned_responses(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }

    /// Maximum concurrent requests this table admits.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().alloc.capacity()
    }
}
