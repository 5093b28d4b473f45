//! Pool-wide admission control.
//!
//! Bounds the total number of in-flight requests to keep queuing explicit
//! and finite. Admission either succeeds immediately, waits in a bounded
//! FIFO queue until a slot frees or a timeout fires, or is rejected
//! outright. Rejection is always surfaced as a `Backpressure` error, never
//! a silent drop. The per-connection bound is enforced separately by
//! stream-id exhaustion.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// What to do when the in-flight ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Wait in a bounded FIFO queue, up to the queue timeout.
    #[default]
    Queue,
    /// Reject immediately.
    Reject,
}

/// Configuration for admission control.
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Hard ceiling on concurrently admitted requests (default: 1024).
    pub max_inflight: usize,
    /// Maximum requests waiting for admission (default: 256).
    pub queue_depth: usize,
    /// How long a queued request waits before rejection (default: 1 second).
    pub queue_timeout: Duration,
    /// Behavior at the ceiling (default: queue).
    pub policy: QueuePolicy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_inflight: 1024,
            queue_depth: 256,
            queue_timeout: Duration::from_secs(1),
            policy: QueuePolicy::Queue,
        }
    }
}

/// Counters exposed for observation.
#[derive(Debug, Clone, Default)]
pub struct BackpressureStats {
    /// Requests admitted without waiting.
    pub admitted: u64,
    /// Requests admitted after queuing.
    pub queued: u64,
    /// Requests rejected.
    pub rejected: u64,
    /// Requests currently waiting for admission.
    pub waiting_now: usize,
    /// Requests currently holding an admission slot.
    pub in_flight: usize,
}

/// Result of one admission attempt.
pub enum Admission {
    /// A slot was free; the permit holds it until dropped.
    Admitted(AdmissionPermit),
    /// The request waited in the queue and then got a slot.
    Queued(AdmissionPermit),
    /// No slot within policy; the caller receives `Backpressure`.
    Rejected,
}

/// RAII admission slot. Dropping it frees the slot, and the semaphore's
/// FIFO fairness re-offers it to the longest-waiting queued request.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Tracks in-flight totals and admits or queues new work.
pub struct BackpressureController {
    config: BackpressureConfig,
    limiter: Arc<Semaphore>,
    waiting: AtomicUsize,
    admitted: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
}

impl BackpressureController {
    /// Creates a controller with the given configuration.
    pub fn new(config: BackpressureConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_inflight));
        Self {
            config,
            limiter,
            waiting: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Attempts to admit one request.
    pub async fn admit(&self) -> Admission {
        if let Ok(permit) = Arc::clone(&self.limiter).try_acquire_owned() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Admission::Admitted(AdmissionPermit { _permit: permit });
        }

        if self.config.policy == QueuePolicy::Reject {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Admission::Rejected;
        }

        if self.waiting.fetch_add(1, Ordering::Relaxed) >= self.config.queue_depth {
            self.waiting.fetch_sub(1, Ordering::Relaxed);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Admission::Rejected;
        }

        let acquired = tokio::time::timeout(
            self.config.queue_timeout,
            Arc::clone(&self.limiter).acquire_owned(),
        )
        .await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);

        match acquired {
            Ok(Ok(permit)) => {
                self.queued.fetch_add(1, Ordering::Relaxed);
                Admission::Queued(AdmissionPermit { _permit: permit })
            }
            _ => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Admission::Rejected
            }
        }
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.config.max_inflight - self.limiter.available_permits()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            waiting_now: self.waiting.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}
