//! Caller-facing session: submit, cancel, shutdown.
//!
//! A session wires the router, admission control, pool, and connections
//! together and drives the retry/speculation machinery for every request.
//! `submit` returns a handle immediately; the request executes on its own
//! task. Attempts race over a channel and the first successful response
//! wins; losing attempts release their resources when they eventually
//! resolve. A request only ever fails with a terminal classified error,
//! after the retry and speculation budgets are spent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backpressure::{Admission, BackpressureController};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::frame::{self, Opcode};
use crate::hedge::{SpeculativePolicy, SpeculativeStats};
use crate::observer::{DriverEvent, DriverObserver, NoopObserver};
use crate::pool::ConnectionPool;
use crate::retry::{AttemptContext, Decision, Outcome, RetryPolicy};
use crate::routing::{LoadTracker, RequestRouter, RoutingKey};
use crate::topology::{ClusterTopology, NodeId, ServerEvent, TopologyUpdate};

/// One request to execute against the cluster.
#[derive(Debug, Clone)]
pub struct Request {
    /// Wire operation, one of the request opcodes.
    pub opcode: Opcode,
    /// Opaque request body, already encoded by the caller.
    pub body: Bytes,
    /// Partition key for token-aware placement, when known.
    pub routing_key: Option<RoutingKey>,
    /// Whether re-executing this request is safe. Gates speculation and
    /// timeout-driven retries.
    pub idempotent: bool,
}

impl Request {
    /// A QUERY request.
    pub fn query(body: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Query,
            body: body.into(),
            routing_key: None,
            idempotent: false,
        }
    }

    /// An EXECUTE request (previously prepared statement).
    pub fn execute(body: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Execute,
            body: body.into(),
            routing_key: None,
            idempotent: false,
        }
    }

    /// A BATCH request.
    pub fn batch(body: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Batch,
            body: body.into(),
            routing_key: None,
            idempotent: false,
        }
    }

    /// Attaches a partition key for token-aware routing.
    pub fn with_routing_key(mut self, key: RoutingKey) -> Self {
        self.routing_key = Some(key);
        self
    }

    /// Declares the request safe to re-execute.
    pub fn idempotent(mut self, yes: bool) -> Self {
        self.idempotent = yes;
        self
    }
}

/// A resolved response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Node that answered.
    pub node: NodeId,
    /// Response body bytes.
    pub body: Bytes,
}

/// Pending result handle returned by [`Session::submit`].
pub struct ExecutionHandle {
    task: JoinHandle<Result<Response>>,
}

impl ExecutionHandle {
    /// Waits for the terminal outcome.
    pub async fn await_result(self) -> Result<Response> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(DriverError::Cancelled),
            Err(_) => Err(DriverError::InvariantViolation {
                reason: "request execution task panicked".to_string(),
            }),
        }
    }

    /// Cancels the request. The already-written frame is not unsent; its
    /// eventual response is discarded.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Entry point for callers.
pub struct Session {
    config: Arc<DriverConfig>,
    topology: Arc<ClusterTopology>,
    pool: Arc<ConnectionPool>,
    router: RequestRouter,
    loads: Arc<LoadTracker>,
    admission: BackpressureController,
    retry_policy: RetryPolicy,
    speculative: SpeculativePolicy,
    observer: Arc<dyn DriverObserver>,
    shutting_down: AtomicBool,
    event_task: JoinHandle<()>,
}

impl Session {
    /// Builds a session from configuration with no observer installed.
    pub fn new(config: DriverConfig) -> Result<Arc<Self>> {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    /// Builds a session from configuration and an observer.
    pub fn with_observer(
        config: DriverConfig,
        observer: Arc<dyn DriverObserver>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let topology = Arc::new(ClusterTopology::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            Arc::clone(&config),
            Arc::clone(&topology),
            Arc::clone(&observer),
            events_tx,
        );
        let loads = Arc::new(LoadTracker::new());
        let router = RequestRouter::new(Arc::clone(&topology), config.policy, Arc::clone(&loads));
        let event_task = tokio::spawn(consume_events(Arc::clone(&topology), events_rx));

        Ok(Arc::new(Self {
            admission: BackpressureController::new(config.backpressure.clone()),
            retry_policy: RetryPolicy::new(config.retry.clone(), config.speculative.clone()),
            speculative: SpeculativePolicy::new(config.speculative.clone()),
            config,
            topology,
            pool,
            router,
            loads,
            observer,
            shutting_down: AtomicBool::new(false),
            event_task,
        }))
    }

    /// Feeds a topology snapshot from the external control-protocol
    /// collaborator.
    pub fn apply_topology_update(&self, update: TopologyUpdate) {
        self.topology.apply_update(update);
    }

    /// Opens the configured minimum of connections to every known node.
    pub async fn warm_up(&self) {
        self.pool.warm_up().await;
    }

    /// Current speculation counters.
    pub fn speculative_stats(&self) -> SpeculativeStats {
        self.speculative.stats()
    }

    /// Submits a request. The returned handle resolves with the response
    /// or a terminal classified error; `deadline` defaults to the
    /// configured request timeout.
    pub fn submit(self: &Arc<Self>, request: Request, deadline: Option<Duration>) -> ExecutionHandle {
        let deadline = deadline.unwrap_or(self.config.request_timeout);
        let session = Arc::clone(self);
        ExecutionHandle {
            task: tokio::spawn(async move { session.execute(request, deadline).await }),
        }
    }

    /// Stops accepting requests and drains the pool.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!("session shutting down");
        self.shutting_down.store(true, Ordering::Release);
        self.pool.shutdown(drain_timeout).await;
        self.event_task.abort();
    }

    async fn execute(self: Arc<Self>, request: Request, deadline: Duration) -> Result<Response> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DriverError::ConnectionLost {
                reason: "session is shut down".to_string(),
            });
        }
        self.speculative.record_request();
        let started = tokio::time::Instant::now();

        let _permit = match self.admission.admit().await {
            Admission::Admitted(permit) | Admission::Queued(permit) => permit,
            Admission::Rejected => {
                self.observer.on_event(&DriverEvent::BackpressureRejected);
                return Err(DriverError::Backpressure {
                    reason: "admission limit reached".to_string(),
                });
            }
        };

        let plan = self.router.route(request.routing_key.as_ref());
        let mut ctx = AttemptContext::new(plan, deadline, request.idempotent);
        let first = match ctx.first_node() {
            Some(node) => node,
            None => return Err(DriverError::NoNodesAvailable),
        };

        // Attempts report here; the sender kept in scope guarantees recv
        // never observes a closed channel while we wait.
        let (results_tx, mut results_rx) =
            mpsc::unbounded_channel::<(NodeId, bool, Result<Response>)>();

        self.spawn_attempt(first, &request, deadline, false, Duration::ZERO, &results_tx);
        let mut attempts_in_flight = 1u32;
        let mut pending_giveup: Option<DriverError> = None;

        let deadline_sleep = tokio::time::sleep(deadline);
        tokio::pin!(deadline_sleep);

        loop {
            tokio::select! {
                Some((node, was_speculative, result)) = results_rx.recv() => {
                    attempts_in_flight -= 1;
                    match result {
                        Ok(response) => {
                            if was_speculative {
                                self.speculative.record_win();
                            }
                            self.observer.on_event(&DriverEvent::RequestCompleted {
                                node,
                                latency: started.elapsed(),
                            });
                            return Ok(response);
                        }
                        Err(error) => {
                            debug!(node = %node, error = %error, "attempt failed");
                            if pending_giveup.is_none() {
                                let outcome = classify(error);
                                match self.retry_policy.on_outcome(&mut ctx, outcome) {
                                    Decision::Complete => {}
                                    Decision::Retry { node, backoff } => {
                                        self.observer.on_event(&DriverEvent::RequestRetried {
                                            node,
                                            attempt: ctx.retries_used(),
                                        });
                                        self.spawn_attempt(
                                            node,
                                            &request,
                                            deadline.saturating_sub(started.elapsed()),
                                            false,
                                            backoff,
                                            &results_tx,
                                        );
                                        attempts_in_flight += 1;
                                    }
                                    Decision::SpeculateNow { node } => {
                                        self.speculative.record_speculation();
                                        self.observer
                                            .on_event(&DriverEvent::SpeculativeStarted { node });
                                        self.spawn_attempt(
                                            node,
                                            &request,
                                            deadline.saturating_sub(started.elapsed()),
                                            true,
                                            Duration::ZERO,
                                            &results_tx,
                                        );
                                        attempts_in_flight += 1;
                                    }
                                    Decision::GiveUp(error) => pending_giveup = Some(error),
                                }
                            }
                            if attempts_in_flight == 0 {
                                if let Some(error) = pending_giveup.take() {
                                    if matches!(error, DriverError::Timeout { .. }) {
                                        self.observer
                                            .on_event(&DriverEvent::RequestTimedOut { node });
                                    }
                                    return Err(error);
                                }
                            }
                        }
                    }
                }
                _ = &mut deadline_sleep => {
                    // Deadline expiry goes through the policy like any other
                    // outcome; with no time left it always gives up.
                    let decision = self.retry_policy.on_outcome(&mut ctx, Outcome::TimedOut);
                    let error = match decision {
                        Decision::GiveUp(error) => error,
                        _ => DriverError::Timeout {
                            elapsed_ms: ctx.elapsed_ms(),
                        },
                    };
                    self.observer.on_event(&DriverEvent::RequestTimedOut { node: first });
                    return Err(error);
                }
                _ = tokio::time::sleep(self.speculative.delay()),
                    if attempts_in_flight > 0
                        && pending_giveup.is_none()
                        && self.speculative.should_speculate(
                            ctx.speculations_used(),
                            request.idempotent,
                        ) =>
                {
                    if let Some(node) = ctx.next_node() {
                        ctx.note_speculation();
                        self.speculative.record_speculation();
                        self.observer.on_event(&DriverEvent::SpeculativeStarted { node });
                        self.spawn_attempt(
                            node,
                            &request,
                            deadline.saturating_sub(started.elapsed()),
                            true,
                            Duration::ZERO,
                            &results_tx,
                        );
                        attempts_in_flight += 1;
                    }
                }
            }
        }
    }

    /// Launches one attempt on its own task. The attempt self-bounds to the
    /// time remaining until the overall deadline, so an abandoned loser
    /// always releases its stream id and load slot.
    fn spawn_attempt(
        self: &Arc<Self>,
        node: NodeId,
        request: &Request,
        attempt_deadline: Duration,
        speculative: bool,
        delay: Duration,
        results: &mpsc::UnboundedSender<(NodeId, bool, Result<Response>)>,
    ) {
        let session = Arc::clone(self);
        let opcode = request.opcode;
        let body = request.body.clone();
        let results = results.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _load = session.loads.start(node);
            let result = session
                .attempt_once(node, opcode, body, attempt_deadline)
                .await;
            let _ = results.send((node, speculative, result));
        });
    }

    async fn attempt_once(
        &self,
        node: NodeId,
        opcode: Opcode,
        body: Bytes,
        attempt_deadline: Duration,
    ) -> Result<Response> {
        let conn = self.pool.acquire(node).await?;
        let pending = conn.send(opcode, body).await?;
        let frame = tokio::time::timeout(attempt_deadline, pending.response())
            .await
            .map_err(|_| DriverError::Timeout {
                elapsed_ms: attempt_deadline.as_millis() as u64,
            })??;

        match frame.header.opcode {
            Opcode::Result => Ok(Response {
                node,
                body: frame.body,
            }),
            Opcode::Error => {
                let (code, message) = frame::parse_error_body(&frame.body)?;
                Err(DriverError::from_server_error(code, message))
            }
            other => {
                let reason = format!("unexpected response opcode {other:?} for request");
                conn.fail(&reason);
                Err(DriverError::ProtocolViolation { reason })
            }
        }
    }
}

/// Applies server-pushed hints from all connections to the shared topology.
async fn consume_events(
    topology: Arc<ClusterTopology>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = events.recv().await {
        debug!(?event, "applying server topology hint");
        topology.apply_hint(&event);
    }
}

fn classify(error: DriverError) -> Outcome {
    if matches!(error, DriverError::Timeout { .. }) {
        Outcome::TimedOut
    } else if RetryPolicy::is_recoverable(&error) {
        Outcome::Recoverable(error)
    } else {
        Outcome::Unrecoverable(error)
    }
}
