//! Request routing over the cluster topology.
//!
//! The router turns a request's optional routing key into an ordered
//! preference list of candidate nodes. It never blocks and never performs
//! I/O; callers and the retry policy walk the list. Policies are a closed
//! set selected by configuration, keeping routing decisions auditable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;

use crate::topology::{ClusterTopology, NodeId};

/// Node-ordering policy for outgoing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingPolicy {
    /// Route to the token owner first, then ring neighbors, then the rest.
    /// Requests without a routing key fall back to round-robin.
    #[default]
    TokenAware,
    /// Rotate over reachable nodes.
    RoundRobin,
    /// Order reachable nodes by current in-flight load, least first.
    LeastBusy,
}

/// Partition key bytes used for token-aware placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey(Bytes);

impl RoutingKey {
    /// Wraps raw partition key bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The key's position on the partitioning ring.
    pub fn token(&self) -> i64 {
        token_for(&self.0)
    }
}

/// Computes the ring token for a partition key: the low 64 bits of
/// Murmur3 x64-128, the cluster's default partitioner hash.
pub fn token_for(key: &[u8]) -> i64 {
    murmur3_x64_128(key, 0).0 as i64
}

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    let len = data.len();
    let n_blocks = len / 16;
    let mut h1 = seed;
    let mut h2 = seed;

    for i in 0..n_blocks {
        let base = i * 16;
        let mut k1 = u64::from_le_bytes(data[base..base + 8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(data[base + 8..base + 16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = &data[n_blocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for i in (8..tail.len()).rev() {
        k2 ^= (tail[i] as u64) << ((i - 8) * 8);
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    for i in (0..tail.len().min(8)).rev() {
        k1 ^= (tail[i] as u64) << (i * 8);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

/// Per-node in-flight counters feeding the least-busy policy.
#[derive(Default)]
pub struct LoadTracker {
    loads: Mutex<HashMap<NodeId, Arc<AtomicUsize>>>,
}

impl LoadTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one request in flight on `node`. The returned guard decrements
    /// the counter when dropped.
    pub fn start(&self, node: NodeId) -> LoadGuard {
        let counter = {
            let mut loads = self.loads.lock().unwrap();
            Arc::clone(loads.entry(node).or_default())
        };
        counter.fetch_add(1, Ordering::Relaxed);
        LoadGuard { counter }
    }

    /// Current in-flight count for `node`.
    pub fn load(&self, node: NodeId) -> usize {
        self.loads
            .lock()
            .unwrap()
            .get(&node)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// RAII in-flight marker from [`LoadTracker::start`].
pub struct LoadGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Chooses target nodes for outgoing requests.
pub struct RequestRouter {
    topology: Arc<ClusterTopology>,
    policy: LoadBalancingPolicy,
    loads: Arc<LoadTracker>,
    round_robin: AtomicUsize,
}

impl RequestRouter {
    /// Creates a router over shared topology and load state. The rotation
    /// cursor starts at a random offset so fleets of clients do not all
    /// hammer the same first node.
    pub fn new(
        topology: Arc<ClusterTopology>,
        policy: LoadBalancingPolicy,
        loads: Arc<LoadTracker>,
    ) -> Self {
        Self {
            topology,
            policy,
            loads,
            round_robin: AtomicUsize::new(rand::thread_rng().gen::<u16>() as usize),
        }
    }

    /// Returns candidate nodes in preference order.
    ///
    /// Unreachable nodes are excluded unless no reachable node remains, in
    /// which case all known nodes are returned as a last resort. An empty
    /// result means the topology is empty.
    pub fn route(&self, key: Option<&RoutingKey>) -> Vec<NodeId> {
        let snapshot = self.topology.snapshot();
        let ups = snapshot.up_nodes();

        let ordered = match (self.policy, key) {
            (LoadBalancingPolicy::TokenAware, Some(key)) => {
                let token = key.token();
                let walk = snapshot.ring_walk(token);
                let mut list: Vec<NodeId> =
                    walk.iter().copied().filter(|id| ups.contains(id)).collect();
                for id in &ups {
                    if !list.contains(id) {
                        list.push(*id);
                    }
                }
                list
            }
            (LoadBalancingPolicy::LeastBusy, _) => {
                let mut list = ups.clone();
                list.sort_by_key(|id| (self.loads.load(*id), *id));
                list
            }
            // Round-robin, and token-aware without a key.
            _ => rotate(&ups, self.round_robin.fetch_add(1, Ordering::Relaxed)),
        };

        if ordered.is_empty() {
            // Last resort: every known node, reachable or not.
            return snapshot.all_nodes();
        }
        ordered
    }
}

fn rotate(nodes: &[NodeId], offset: usize) -> Vec<NodeId> {
    if nodes.is_empty() {
        return Vec::new();
    }
    let pivot = offset % nodes.len();
    let mut out = Vec::with_capacity(nodes.len());
    out.extend_from_slice(&nodes[pivot..]);
    out.extend_from_slice(&nodes[..pivot]);
    out
}
