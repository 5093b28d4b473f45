//! Connection pool: a bounded set of connections per node.
//!
//! For each node the pool keeps between the configured minimum and maximum
//! of connections. Acquisition picks the ready connection with the fewest
//! in-flight requests, opening a new one below the maximum; at the maximum
//! with every connection saturated it signals backpressure. A connection
//! failure schedules reconnection with bounded exponential backoff, and a
//! node failing repeatedly is reported unreachable to the topology until a
//! reconnect succeeds. The connection set sits behind one coarse lock:
//! membership changes are rare next to per-request traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::connection::{Connection, ConnectionOptions, ConnectionSignal, ConnectionState};
use crate::error::{DriverError, Result};
use crate::observer::{DriverEvent, DriverObserver};
use crate::retry::backoff_delay;
use crate::topology::{ClusterTopology, NodeId, ServerEvent};

/// Aggregate pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Nodes with at least one tracked connection.
    pub nodes: usize,
    /// Tracked connections across all nodes.
    pub total_connections: usize,
    /// Requests in flight across all connections.
    pub total_in_flight: usize,
}

#[derive(Default)]
struct NodeSlot {
    conns: Vec<Arc<Connection>>,
    consecutive_failures: u32,
}

impl NodeSlot {
    fn prune(&mut self) {
        self.conns.retain(|c| {
            !matches!(
                c.state(),
                ConnectionState::Failed | ConnectionState::Closed
            )
        });
    }

    fn least_loaded_ready(&self) -> Option<Arc<Connection>> {
        self.conns
            .iter()
            .filter(|c| c.is_ready())
            .min_by_key(|c| c.in_flight())
            .cloned()
    }
}

/// Owns every connection to every node.
pub struct ConnectionPool {
    config: Arc<DriverConfig>,
    topology: Arc<ClusterTopology>,
    observer: Arc<dyn DriverObserver>,
    events: mpsc::UnboundedSender<ServerEvent>,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
    nodes: Mutex<HashMap<NodeId, NodeSlot>>,
    shutting_down: AtomicBool,
}

impl ConnectionPool {
    /// Creates the pool and spawns its failure supervisor.
    ///
    /// `events` receives server-pushed topology hints from every connection
    /// the pool opens.
    pub fn new(
        config: Arc<DriverConfig>,
        topology: Arc<ClusterTopology>,
        observer: Arc<dyn DriverObserver>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            config,
            topology,
            observer,
            events,
            signal_tx,
            nodes: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(supervise(Arc::clone(&pool), signal_rx));
        pool
    }

    /// Returns a ready connection to `node`, least-loaded first.
    ///
    /// Opens a new connection when none is ready and the node is below its
    /// maximum; fails with `Backpressure` when the pool is at the maximum
    /// and every connection is saturated.
    pub async fn acquire(&self, node: NodeId) -> Result<Arc<Connection>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DriverError::ConnectionLost {
                reason: "pool is shutting down".to_string(),
            });
        }

        {
            let mut nodes = self.nodes.lock().await;
            let slot = nodes.entry(node).or_default();
            slot.prune();

            if let Some(best) = slot.least_loaded_ready() {
                if best.in_flight() < self.config.max_inflight_per_connection {
                    return Ok(best);
                }
                if slot.conns.len() >= self.config.max_connections_per_node {
                    return Err(DriverError::Backpressure {
                        reason: format!("all connections to {node} saturated"),
                    });
                }
            } else if slot.conns.len() >= self.config.max_connections_per_node {
                return Err(DriverError::Backpressure {
                    reason: format!("no ready connection to {node}"),
                });
            }
        }

        self.open_connection(node).await
    }

    /// Opens connections up to the configured minimum for every node in the
    /// current topology snapshot. Failures are counted but not fatal; the
    /// pool keeps serving nodes it could reach.
    pub async fn warm_up(&self) {
        let snapshot = self.topology.snapshot();
        for node in snapshot.all_nodes() {
            for _ in 0..self.config.min_connections_per_node {
                let ready = {
                    let mut nodes = self.nodes.lock().await;
                    let slot = nodes.entry(node).or_default();
                    slot.prune();
                    slot.conns.iter().filter(|c| c.is_ready()).count()
                };
                if ready >= self.config.min_connections_per_node {
                    break;
                }
                if let Err(e) = self.open_connection(node).await {
                    debug!(node = %node, error = %e, "warm-up connect failed");
                    break;
                }
            }
        }
    }

    async fn open_connection(&self, node: NodeId) -> Result<Arc<Connection>> {
        let addr = self
            .topology
            .snapshot()
            .node(node)
            .ok_or(DriverError::NoNodesAvailable)?
            .addr;

        let opts = ConnectionOptions::from(self.config.as_ref());
        let connected = Connection::connect(
            node,
            addr,
            opts,
            Arc::clone(&self.observer),
            self.events.clone(),
            self.signal_tx.clone(),
        )
        .await;

        let mut nodes = self.nodes.lock().await;
        let slot = nodes.entry(node).or_default();
        match connected {
            Ok(conn) => {
                let was_degraded = slot.consecutive_failures >= self.config.failure_threshold;
                slot.consecutive_failures = 0;
                if was_degraded {
                    self.topology.mark_up(node);
                    self.observer.on_event(&DriverEvent::NodeUp { node });
                } else {
                    self.topology.mark_up(node);
                }
                slot.prune();
                if slot.conns.len() >= self.config.max_connections_per_node {
                    // A concurrent open won the race; keep the set bounded.
                    let extra = Arc::clone(&conn);
                    tokio::spawn(async move { extra.close().await });
                    return slot
                        .least_loaded_ready()
                        .ok_or_else(|| DriverError::Backpressure {
                            reason: format!("no ready connection to {node}"),
                        });
                }
                slot.conns.push(Arc::clone(&conn));
                Ok(conn)
            }
            Err(e) => {
                slot.consecutive_failures += 1;
                if slot.consecutive_failures == self.config.failure_threshold {
                    warn!(node = %node, failures = slot.consecutive_failures, "node marked unreachable");
                    self.topology.mark_down(node);
                    self.observer.on_event(&DriverEvent::NodeDown { node });
                }
                Err(e)
            }
        }
    }

    /// Closes every connection gracefully, honoring per-connection drains.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let conns: Vec<Arc<Connection>> = {
            let mut nodes = self.nodes.lock().await;
            nodes.drain().flat_map(|(_, slot)| slot.conns).collect()
        };
        info!(connections = conns.len(), "draining pool");

        let mut tasks = Vec::with_capacity(conns.len());
        for conn in conns {
            tasks.push(tokio::spawn(async move {
                conn.drain(drain_timeout).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Aggregate statistics over all tracked connections.
    pub async fn stats(&self) -> PoolStats {
        let nodes = self.nodes.lock().await;
        let total_connections = nodes.values().map(|s| s.conns.len()).sum();
        let total_in_flight = nodes
            .values()
            .flat_map(|s| s.conns.iter())
            .map(|c| c.in_flight())
            .sum();
        PoolStats {
            nodes: nodes.len(),
            total_connections,
            total_in_flight,
        }
    }
}

/// Consumes failure signals and schedules reconnection.
async fn supervise(pool: Arc<ConnectionPool>, mut signals: mpsc::UnboundedReceiver<ConnectionSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            ConnectionSignal::Failed { node } => {
                {
                    let mut nodes = pool.nodes.lock().await;
                    if let Some(slot) = nodes.get_mut(&node) {
                        slot.prune();
                    }
                }
                if pool.shutting_down.load(Ordering::Acquire) {
                    continue;
                }
                tokio::spawn(reconnect(Arc::clone(&pool), node));
            }
        }
    }
}

/// Retries opening a connection to `node` with exponential backoff until it
/// succeeds, the node leaves the topology, or the pool shuts down.
async fn reconnect(pool: Arc<ConnectionPool>, node: NodeId) {
    let mut attempt = 0u32;
    loop {
        if pool.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if pool.topology.snapshot().node(node).is_none() {
            debug!(node = %node, "node left topology, abandoning reconnect");
            return;
        }

        let delay = backoff_delay(&pool.config.retry, attempt);
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);

        match pool.open_connection(node).await {
            Ok(_) => {
                info!(node = %node, attempt, "reconnected");
                return;
            }
            Err(e) => {
                debug!(node = %node, attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Opcode;
    use crate::observer::NoopObserver;
    use crate::retry::RetryConfig;
    use crate::testserver::{MockBehavior, MockNode};
    use crate::topology::{NodeState, Reachability, TopologyUpdate};
    use bytes::Bytes;

    fn test_config() -> DriverConfig {
        DriverConfig {
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn pool_for(
        servers: &[(u64, &MockNode)],
        config: DriverConfig,
    ) -> (Arc<ConnectionPool>, Arc<ClusterTopology>) {
        let topology = Arc::new(ClusterTopology::new());
        topology.apply_update(TopologyUpdate {
            nodes: servers
                .iter()
                .map(|(id, server)| {
                    NodeState::up(NodeId::new(*id), server.addr(), vec![*id as i64 * 100])
                })
                .collect(),
        });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            Arc::new(config),
            Arc::clone(&topology),
            Arc::new(NoopObserver),
            events_tx,
        );
        (pool, topology)
    }

    #[tokio::test]
    async fn test_acquire_opens_on_demand_and_reuses() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (pool, _topology) = pool_for(&[(1, &server)], test_config()).await;

        let a = pool.acquire(NodeId::new(1)).await.unwrap();
        let b = pool.acquire(NodeId::new(1)).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b), "unsaturated connection is reused");
        assert_eq!(pool.stats().await.total_connections, 1);
    }

    #[tokio::test]
    async fn test_saturation_opens_new_then_backpressures() {
        let server = MockNode::start(MockBehavior {
            silent: true,
            ..Default::default()
        })
        .await;
        let config = DriverConfig {
            max_connections_per_node: 2,
            max_inflight_per_connection: 1,
            ..test_config()
        };
        let (pool, _topology) = pool_for(&[(1, &server)], config).await;

        let first = pool.acquire(NodeId::new(1)).await.unwrap();
        let _held_a = first
            .send(Opcode::Query, Bytes::from_static(b"q"))
            .await
            .unwrap();

        // First connection saturated: a second one is opened.
        let second = pool.acquire(NodeId::new(1)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        let _held_b = second
            .send(Opcode::Query, Bytes::from_static(b"q"))
            .await
            .unwrap();

        // Both saturated at the maximum: backpressure.
        let err = pool.acquire(NodeId::new(1)).await.unwrap_err();
        assert!(matches!(err, DriverError::Backpressure { .. }));
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_failure() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (pool, _topology) = pool_for(&[(1, &server)], test_config()).await;

        let conn = pool.acquire(NodeId::new(1)).await.unwrap();
        assert!(conn.is_ready());
        let before = server.connections_accepted();

        server.kill_connections();
        // The failed connection signals the supervisor, which reconnects
        // with backoff.
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connections_accepted() <= before {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool never reconnected");

        let fresh = pool.acquire(NodeId::new(1)).await.unwrap();
        assert!(fresh.is_ready());
    }

    #[tokio::test]
    async fn test_repeated_failures_mark_node_down() {
        // Bind-then-drop gives an address nothing listens on.
        let vacant = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let topology = Arc::new(ClusterTopology::new());
        topology.apply_update(TopologyUpdate {
            nodes: vec![NodeState::up(NodeId::new(1), vacant, vec![0])],
        });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = DriverConfig {
            failure_threshold: 3,
            connect_timeout: Duration::from_millis(300),
            ..test_config()
        };
        let pool = ConnectionPool::new(
            Arc::new(config),
            Arc::clone(&topology),
            Arc::new(NoopObserver),
            events_tx,
        );

        for _ in 0..3 {
            assert!(pool.acquire(NodeId::new(1)).await.is_err());
        }
        assert_eq!(
            topology.snapshot().node(NodeId::new(1)).unwrap().reachability,
            Reachability::Down
        );
    }

    #[tokio::test]
    async fn test_successful_reconnect_clears_degradation() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (pool, topology) = pool_for(&[(1, &server)], test_config()).await;

        topology.mark_down(NodeId::new(1));
        pool.acquire(NodeId::new(1)).await.unwrap();
        assert_eq!(
            topology.snapshot().node(NodeId::new(1)).unwrap().reachability,
            Reachability::Up
        );
    }

    #[tokio::test]
    async fn test_warm_up_reaches_minimum() {
        let server_a = MockNode::start(MockBehavior::default()).await;
        let server_b = MockNode::start(MockBehavior::default()).await;
        let config = DriverConfig {
            min_connections_per_node: 2,
            ..test_config()
        };
        let (pool, _topology) = pool_for(&[(1, &server_a), (2, &server_b)], config).await;

        pool.warm_up().await;
        let stats = pool.stats().await;
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.total_connections, 4);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_acquires() {
        let server = MockNode::start(MockBehavior::default()).await;
        let (pool, _topology) = pool_for(&[(1, &server)], test_config()).await;

        let conn = pool.acquire(NodeId::new(1)).await.unwrap();
        pool.shutdown(Duration::from_millis(500)).await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(pool.acquire(NodeId::new(1)).await.is_err());
        assert_eq!(pool.stats().await.total_connections, 0);
    }
}
