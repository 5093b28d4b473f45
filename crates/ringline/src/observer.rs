//! Narrow observer interface for the external metrics/tracing collaborator.
//!
//! The core emits discrete events and never depends on the observer being
//! present or succeeding. Implementations must return quickly and must not
//! block; anything expensive belongs on the collaborator's side of the
//! boundary.

use std::time::Duration;

use crate::topology::NodeId;

/// Discrete events emitted by the driver core.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A connection finished its handshake and entered Ready.
    ConnectionOpened {
        /// Node the connection belongs to.
        node: NodeId,
        /// Peer address.
        addr: String,
    },
    /// A connection was closed gracefully.
    ConnectionClosed {
        /// Node the connection belonged to.
        node: NodeId,
    },
    /// A connection died on an I/O error or protocol fault.
    ConnectionFailed {
        /// Node the connection belonged to.
        node: NodeId,
        /// Failure description.
        reason: String,
    },
    /// A request was written to a connection.
    RequestSubmitted {
        /// Target node.
        node: NodeId,
    },
    /// A request resolved successfully.
    RequestCompleted {
        /// Node that answered.
        node: NodeId,
        /// Time from submission to resolution.
        latency: Duration,
    },
    /// A request is being retried on a (possibly different) node.
    RequestRetried {
        /// Next target node.
        node: NodeId,
        /// 1-based retry number.
        attempt: u32,
    },
    /// A request's deadline elapsed before any response arrived.
    RequestTimedOut {
        /// Node of the last attempt.
        node: NodeId,
    },
    /// A speculative duplicate was issued while the original stayed in flight.
    SpeculativeStarted {
        /// Node receiving the duplicate.
        node: NodeId,
    },
    /// Admission control rejected a request outright.
    BackpressureRejected,
    /// A node became reachable.
    NodeUp {
        /// The node.
        node: NodeId,
    },
    /// A node became unreachable.
    NodeDown {
        /// The node.
        node: NodeId,
    },
}

/// Receiver for [`DriverEvent`]s. All methods are best-effort; the core
/// ignores whatever the observer does with an event.
pub trait DriverObserver: Send + Sync {
    /// Called once per event, inline on the emitting path.
    fn on_event(&self, event: &DriverEvent);
}

/// Observer that drops every event. The default when none is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DriverObserver for NoopObserver {
    fn on_event(&self, _event: &DriverEvent) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every event for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<DriverEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<DriverEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn count<F: Fn(&DriverEvent) -> bool>(&self, pred: F) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    impl DriverObserver for RecordingObserver {
        fn on_event(&self, event: &DriverEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
