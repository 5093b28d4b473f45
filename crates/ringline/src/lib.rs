#![warn(missing_docs)]

//! ringline: cluster database driver core.
//!
//! Speaks the cluster's frame-based binary protocol over persistent TCP
//! connections to multiple nodes, multiplexing concurrent requests per
//! connection by stream id. The core covers frame encoding/decoding,
//! connection pooling with health tracking and reconnection,
//! topology-aware request routing, retry and speculative execution, and
//! backpressure-aware admission. Query building, object mapping, schema
//! introspection, and metrics backends live outside this crate; metrics
//! flow out through the narrow [`observer::DriverObserver`] interface.

pub mod backpressure;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod hedge;
pub mod mux;
pub mod observer;
pub mod pool;
pub mod retry;
pub mod routing;
pub mod session;
pub mod stream;
pub mod topology;

#[cfg(test)]
mod testserver;

pub use config::{Credentials, DriverConfig};
pub use error::{DriverError, Result, ServerErrorCode};
pub use frame::{Compression, Frame, FrameCodec, Opcode};
pub use observer::{DriverEvent, DriverObserver, NoopObserver};
pub use routing::{LoadBalancingPolicy, RoutingKey};
pub use session::{ExecutionHandle, Request, Response, Session};
pub use topology::{NodeId, NodeState, Reachability, TopologyUpdate};
