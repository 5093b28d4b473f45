//! Retry decisions for failed or timed-out request attempts.
//!
//! The policy is a pure decision function over an attempt context: given
//! what happened to the last attempt, it answers retry on the next
//! candidate, race a speculative duplicate now, or give up with a terminal
//! classified error. Budgets for retries and speculation are bounded by
//! configuration; exceeding either yields `GiveUp`.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::DriverError;
use crate::hedge::SpeculativeConfig;
use crate::topology::NodeId;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3).
    pub max_retries: u32,
    /// Initial backoff duration (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 10 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// What happened to the last attempt.
#[derive(Debug)]
pub enum Outcome {
    /// A response frame arrived.
    Success,
    /// The attempt failed in a way that may succeed elsewhere.
    Recoverable(DriverError),
    /// The attempt failed in a way no retry can fix.
    Unrecoverable(DriverError),
    /// The attempt's timer elapsed while the overall deadline still has
    /// time left.
    TimedOut,
}

/// The policy's answer for one outcome.
#[derive(Debug)]
pub enum Decision {
    /// The request is done; hand the response to the caller.
    Complete,
    /// Try again on `node` after `backoff`.
    Retry {
        /// Next candidate node.
        node: NodeId,
        /// Delay before the retry is issued.
        backoff: Duration,
    },
    /// Issue a duplicate on `node` immediately, keeping the original in
    /// flight; first response wins.
    SpeculateNow {
        /// Node for the duplicate.
        node: NodeId,
    },
    /// Stop; the error is terminal and goes to the caller as-is.
    GiveUp(DriverError),
}

/// Mutable per-request state the policy advances across attempts.
#[derive(Debug)]
pub struct AttemptContext {
    plan: Vec<NodeId>,
    cursor: usize,
    retries_used: u32,
    speculations_used: u32,
    started: Instant,
    deadline: Duration,
    idempotent: bool,
}

impl AttemptContext {
    /// Creates a context over the router's candidate list.
    ///
    /// `idempotent` is the caller's declaration. A timed-out attempt may
    /// already have executed on the server, so timeouts only lead to
    /// retries or duplicates for idempotent requests.
    pub fn new(plan: Vec<NodeId>, deadline: Duration, idempotent: bool) -> Self {
        Self {
            plan,
            cursor: 0,
            retries_used: 0,
            speculations_used: 0,
            started: Instant::now(),
            deadline,
            idempotent,
        }
    }

    /// The first candidate, if any.
    pub fn first_node(&mut self) -> Option<NodeId> {
        self.next_node()
    }

    /// Advances to the next candidate, wrapping around the plan. The retry
    /// and speculation budgets bound how often this is consulted.
    pub fn next_node(&mut self) -> Option<NodeId> {
        if self.plan.is_empty() {
            return None;
        }
        let node = self.plan[self.cursor % self.plan.len()];
        self.cursor += 1;
        Some(node)
    }

    /// Time left before the overall deadline, `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.checked_sub(self.started.elapsed())
    }

    /// Milliseconds since the request was submitted.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Retries consumed so far.
    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Speculative duplicates issued so far.
    pub fn speculations_used(&self) -> u32 {
        self.speculations_used
    }

    /// Records one speculative duplicate. Called by the executor when the
    /// speculation timer, not an outcome, triggers the duplicate.
    pub fn note_speculation(&mut self) {
        self.speculations_used += 1;
    }
}

/// Decision function over attempt outcomes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry: RetryConfig,
    speculative: SpeculativeConfig,
}

impl RetryPolicy {
    /// Creates a policy from the retry and speculation configurations.
    pub fn new(retry: RetryConfig, speculative: SpeculativeConfig) -> Self {
        Self { retry, speculative }
    }

    /// Whether an error may succeed on a retry, possibly on another node.
    pub fn is_recoverable(error: &DriverError) -> bool {
        match error {
            DriverError::ConnectionLost { .. } => true,
            DriverError::ConnectTimeout { .. } => true,
            DriverError::RecoverableServerError { .. } => true,
            DriverError::Backpressure { .. } => true,
            DriverError::Io(_) => true,
            DriverError::Timeout { .. } => false,
            DriverError::FrameCorruption { .. } => false,
            DriverError::ProtocolViolation { .. } => false,
            DriverError::UnrecoverableServerError { .. } => false,
            DriverError::Cancelled => false,
            DriverError::NoNodesAvailable => false,
            DriverError::Config { .. } => false,
            DriverError::InvariantViolation { .. } => false,
        }
    }

    /// Decides what to do after an attempt resolved with `outcome`.
    pub fn on_outcome(&self, ctx: &mut AttemptContext, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Success => Decision::Complete,
            Outcome::Unrecoverable(error) => Decision::GiveUp(error),
            Outcome::Recoverable(error) => {
                if ctx.remaining().is_none() {
                    return Decision::GiveUp(DriverError::Timeout {
                        elapsed_ms: ctx.elapsed_ms(),
                    });
                }
                if ctx.retries_used >= self.retry.max_retries {
                    return Decision::GiveUp(error);
                }
                let node = match ctx.next_node() {
                    Some(node) => node,
                    None => return Decision::GiveUp(error),
                };
                ctx.retries_used += 1;
                Decision::Retry {
                    node,
                    backoff: self.compute_backoff(ctx.retries_used - 1),
                }
            }
            Outcome::TimedOut => {
                if ctx.remaining().is_none() || !ctx.idempotent {
                    return Decision::GiveUp(DriverError::Timeout {
                        elapsed_ms: ctx.elapsed_ms(),
                    });
                }
                if ctx.speculations_used < self.speculative.max_speculative {
                    if let Some(node) = ctx.next_node() {
                        ctx.speculations_used += 1;
                        return Decision::SpeculateNow { node };
                    }
                }
                if ctx.retries_used < self.retry.max_retries {
                    if let Some(node) = ctx.next_node() {
                        ctx.retries_used += 1;
                        return Decision::Retry {
                            node,
                            backoff: self.compute_backoff(ctx.retries_used - 1),
                        };
                    }
                }
                Decision::GiveUp(DriverError::Timeout {
                    elapsed_ms: ctx.elapsed_ms(),
                })
            }
        }
    }

    /// Exponential backoff for the given 0-based attempt.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        backoff_delay(&self.retry, attempt)
    }
}

/// Exponential backoff: `initial * multiplier^attempt`, capped at the
/// configured maximum, with optional jitter in `[0, delay/2]`. Shared by
/// request retries and pool reconnection.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config.initial_backoff.as_millis() as f64;
    let max_ms = config.max_backoff.as_millis() as f64;
    let computed = base_ms * config.backoff_multiplier.powi(attempt as i32);
    let capped = computed.min(max_ms) as u64;

    if config.jitter && capped > 0 {
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped.saturating_add(jitter))
    } else {
        Duration::from_millis(capped)
    }
}
