//! Speculative execution for hiding tail latency.
//!
//! When an attempt takes longer than the configured delay, a duplicate is
//! raced against it on the next candidate node. The first response wins;
//! the loser's resources are released when it eventually resolves. A load
//! cap keeps speculation from amplifying traffic during incidents.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Configuration for speculative execution.
#[derive(Debug, Clone)]
pub struct SpeculativeConfig {
    /// Whether speculation is enabled (default: true).
    pub enabled: bool,
    /// How long an attempt may be pending before a duplicate is raced
    /// (default: 50ms).
    pub delay: Duration,
    /// Maximum speculative duplicates per request (default: 2).
    pub max_speculative: u32,
    /// Restrict speculation to requests marked idempotent (default: true).
    pub only_idempotent: bool,
    /// Maximum share of requests allowed to speculate, as a percentage
    /// (default: 10).
    pub max_extra_load_pct: u8,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_millis(50),
            max_speculative: 2,
            only_idempotent: true,
            max_extra_load_pct: 10,
        }
    }
}

/// Statistics about speculation behavior.
#[derive(Debug, Clone, Default)]
pub struct SpeculativeStats {
    /// Requests that went through the executor.
    pub total_requests: u64,
    /// Speculative duplicates issued.
    pub total_speculations: u64,
    /// Requests won by a speculative duplicate rather than the original.
    pub speculative_wins: u64,
}

/// Decides when a speculative duplicate may be issued.
pub struct SpeculativePolicy {
    config: SpeculativeConfig,
    total_requests: AtomicU64,
    total_speculations: AtomicU64,
    speculative_wins: AtomicU64,
}

impl SpeculativePolicy {
    /// Creates a policy with the given configuration.
    pub fn new(config: SpeculativeConfig) -> Self {
        Self {
            config,
            total_requests: AtomicU64::new(0),
            total_speculations: AtomicU64::new(0),
            speculative_wins: AtomicU64::new(0),
        }
    }

    /// The delay before the first duplicate may be raced.
    pub fn delay(&self) -> Duration {
        self.config.delay
    }

    /// Whether a duplicate may be issued now.
    ///
    /// `issued` is how many duplicates this request already raced;
    /// `idempotent` is the caller's declaration about the request.
    pub fn should_speculate(&self, issued: u32, idempotent: bool) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.config.only_idempotent && !idempotent {
            return false;
        }
        if issued >= self.config.max_speculative {
            return false;
        }
        let requests = self.total_requests.load(Ordering::Relaxed);
        let speculations = self.total_speculations.load(Ordering::Relaxed);
        if requests > 0 {
            let rate = speculations as f64 / requests as f64;
            if rate >= self.config.max_extra_load_pct as f64 / 100.0 {
                return false;
            }
        }
        true
    }

    /// Records a request entering the executor.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an issued duplicate.
    pub fn record_speculation(&self) {
        self.total_speculations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request won by a duplicate instead of the original.
    pub fn record_win(&self) {
        self.speculative_wins.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SpeculativeStats {
        SpeculativeStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_speculations: self.total_speculations.load(Ordering::Relaxed),
            speculative_wins: self.speculative_wins.load(Ordering::Relaxed),
        }
    }
}
