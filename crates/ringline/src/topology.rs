//! Cluster topology: known nodes, token ownership, reachability.
//!
//! Topology state is an immutable snapshot behind an atomic swap. Readers
//! (the router, on every request) load the current snapshot lock-free;
//! updates build a new snapshot and swap it in, so a concurrent reader
//! never observes a partially-applied change.
//!
//! The core does not discover topology itself. It consumes snapshot updates
//! from the external control-protocol collaborator, reachability signals
//! from the connection pool, and server-pushed event hints.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DriverError, Result};
use crate::frame::{get_inet, get_string};

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a NodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the underlying u64 value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Whether a node is currently believed reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reachability {
    /// Node answered recently.
    Up,
    /// Node failed across all its connections or was reported down.
    Down,
    /// No signal yet.
    #[default]
    Unknown,
}

/// State of one known node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Node identity.
    pub id: NodeId,
    /// Native-protocol address.
    pub addr: SocketAddr,
    /// Tokens this node owns on the partitioning ring.
    pub tokens: Vec<i64>,
    /// Current reachability.
    pub reachability: Reachability,
    /// Last reachability change, milliseconds since the UNIX epoch.
    pub last_seen_ms: u64,
}

impl NodeState {
    /// Creates a node entry with unknown reachability.
    pub fn new(id: NodeId, addr: SocketAddr, tokens: Vec<i64>) -> Self {
        Self {
            id,
            addr,
            tokens,
            reachability: Reachability::Unknown,
            last_seen_ms: now_ms(),
        }
    }

    /// Same, already marked up. Convenient for feed snapshots and tests.
    pub fn up(id: NodeId, addr: SocketAddr, tokens: Vec<i64>) -> Self {
        Self {
            reachability: Reachability::Up,
            ..Self::new(id, addr, tokens)
        }
    }
}

/// Immutable view of the cluster at one point in time.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    version: u64,
    nodes: HashMap<NodeId, NodeState>,
    ring: BTreeMap<i64, NodeId>,
}

impl TopologySnapshot {
    fn build(version: u64, nodes: HashMap<NodeId, NodeState>) -> Self {
        let mut ring = BTreeMap::new();
        for node in nodes.values() {
            for token in &node.tokens {
                ring.insert(*token, node.id);
            }
        }
        Self {
            version,
            nodes,
            ring,
        }
    }

    /// Snapshot generation, monotonically increasing.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Looks up one node.
    pub fn node(&self, id: NodeId) -> Option<&NodeState> {
        self.nodes.get(&id)
    }

    /// Finds a node by its native-protocol address.
    pub fn node_by_addr(&self, addr: &SocketAddr) -> Option<&NodeState> {
        self.nodes.values().find(|n| n.addr == *addr)
    }

    /// All known node ids, sorted for deterministic iteration.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Ids of nodes currently believed reachable, sorted.
    pub fn up_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.reachability == Reachability::Up)
            .map(|n| n.id)
            .collect();
        ids.sort();
        ids
    }

    /// The node owning `token`: the first ring entry at or after the token,
    /// wrapping to the ring start.
    pub fn owner_of(&self, token: i64) -> Option<NodeId> {
        self.ring
            .range(token..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, id)| *id)
    }

    /// Distinct nodes in ring order starting at the owner of `token`.
    ///
    /// This is the replica preference order for token-aware routing: the
    /// owner first, then successive ring neighbors.
    pub fn ring_walk(&self, token: i64) -> Vec<NodeId> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let after = self.ring.range(token..).map(|(_, id)| *id);
        let before = self.ring.range(..token).map(|(_, id)| *id);
        for id in after.chain(before) {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }

    /// True when no nodes are known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// A full snapshot update from the external topology feed.
#[derive(Debug, Clone)]
pub struct TopologyUpdate {
    /// The complete new node set, replacing the previous one.
    pub nodes: Vec<NodeState>,
}

/// Kinds of server-pushed topology change hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChangeKind {
    /// A node joined the cluster.
    NewNode,
    /// A node left the cluster.
    RemovedNode,
    /// A node changed its token ownership.
    MovedNode,
}

/// Server-initiated event pushed on a registered connection.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Cluster membership changed.
    TopologyChange {
        /// What changed.
        kind: TopologyChangeKind,
        /// Affected node address.
        addr: SocketAddr,
    },
    /// A node's reachability changed.
    StatusChange {
        /// True for UP, false for DOWN.
        up: bool,
        /// Affected node address.
        addr: SocketAddr,
    },
}

impl ServerEvent {
    /// Parses an EVENT frame body: event type string, change string, inet.
    pub fn parse(body: &Bytes) -> Result<Self> {
        let mut cursor = body.clone();
        let event_type = get_string(&mut cursor)?;
        let change = get_string(&mut cursor)?;
        let addr = get_inet(&mut cursor)?;
        match event_type.as_str() {
            "TOPOLOGY_CHANGE" => {
                let kind = match change.as_str() {
                    "NEW_NODE" => TopologyChangeKind::NewNode,
                    "REMOVED_NODE" => TopologyChangeKind::RemovedNode,
                    "MOVED_NODE" => TopologyChangeKind::MovedNode,
                    other => {
                        return Err(DriverError::ProtocolViolation {
                            reason: format!("unknown topology change {other}"),
                        })
                    }
                };
                Ok(ServerEvent::TopologyChange { kind, addr })
            }
            "STATUS_CHANGE" => match change.as_str() {
                "UP" => Ok(ServerEvent::StatusChange { up: true, addr }),
                "DOWN" => Ok(ServerEvent::StatusChange { up: false, addr }),
                other => Err(DriverError::ProtocolViolation {
                    reason: format!("unknown status change {other}"),
                }),
            },
            other => Err(DriverError::ProtocolViolation {
                reason: format!("unknown event type {other}"),
            }),
        }
    }
}

/// Shared, atomically-swapped topology state.
pub struct ClusterTopology {
    current: ArcSwap<TopologySnapshot>,
    version: AtomicU64,
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterTopology {
    /// Creates an empty topology.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(TopologySnapshot::default()),
            version: AtomicU64::new(0),
        }
    }

    /// Loads the current snapshot. Lock-free; the returned Arc stays valid
    /// even if an update lands immediately after.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    /// Replaces the node set wholesale from a feed update. Reachability
    /// carried in the update is trusted as the feed's view.
    pub fn apply_update(&self, update: TopologyUpdate) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let nodes: HashMap<NodeId, NodeState> =
            update.nodes.into_iter().map(|n| (n.id, n)).collect();
        let next = TopologySnapshot::build(version, nodes);
        debug!(version, nodes = next.len(), "topology update applied");
        self.current.store(Arc::new(next));
    }

    /// Marks a node reachable. Health signal from the connection pool.
    pub fn mark_up(&self, id: NodeId) {
        self.set_reachability(id, Reachability::Up);
    }

    /// Marks a node unreachable. Health signal from the connection pool.
    pub fn mark_down(&self, id: NodeId) {
        self.set_reachability(id, Reachability::Down);
    }

    fn set_reachability(&self, id: NodeId, reachability: Reachability) {
        self.mutate(|nodes| {
            if let Some(node) = nodes.get_mut(&id) {
                if node.reachability != reachability {
                    debug!(node = %id, ?reachability, "node reachability changed");
                }
                node.reachability = reachability;
                node.last_seen_ms = now_ms();
            }
        });
    }

    /// Applies a server-pushed hint. Status changes flip reachability;
    /// a REMOVED_NODE drops the node. NEW_NODE and MOVED_NODE are left to
    /// the feed, which owns token assignment.
    pub fn apply_hint(&self, event: &ServerEvent) {
        match event {
            ServerEvent::StatusChange { up, addr } => {
                let snapshot = self.snapshot();
                if let Some(node) = snapshot.node_by_addr(addr) {
                    let id = node.id;
                    self.set_reachability(
                        id,
                        if *up { Reachability::Up } else { Reachability::Down },
                    );
                }
            }
            ServerEvent::TopologyChange { kind, addr } => {
                if *kind == TopologyChangeKind::RemovedNode {
                    let snapshot = self.snapshot();
                    if let Some(node) = snapshot.node_by_addr(addr) {
                        let id = node.id;
                        self.mutate(|nodes| {
                            nodes.remove(&id);
                        });
                    }
                }
            }
        }
    }

    fn mutate<F: Fn(&mut HashMap<NodeId, NodeState>)>(&self, f: F) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        self.current.rcu(|cur| {
            let mut nodes = cur.nodes.clone();
            f(&mut nodes);
            Arc::new(TopologySnapshot::build(version, nodes))
        });
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
