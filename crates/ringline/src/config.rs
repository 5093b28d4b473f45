//! Driver configuration.
//!
//! Every tunable the core recognizes, with safe defaults. Policy constants
//! that the protocol does not pin down (backoff curve, retry and
//! speculation budgets, queue depth) are deliberately configuration rather
//! than hard-coded values.

use std::time::Duration;

use crate::backpressure::BackpressureConfig;
use crate::error::{DriverError, Result};
use crate::frame::{Compression, DEFAULT_MAX_FRAME_LEN};
use crate::hedge::SpeculativeConfig;
use crate::retry::RetryConfig;
use crate::routing::LoadBalancingPolicy;

/// Credentials for the optional authentication exchange during handshake.
#[derive(Clone)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Account secret.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Minimum connections kept open per node (default: 1).
    pub min_connections_per_node: usize,
    /// Maximum connections opened per node (default: 4).
    pub max_connections_per_node: usize,
    /// Maximum in-flight requests per connection, capped by the protocol's
    /// stream-id limit (default: 1024).
    pub max_inflight_per_connection: usize,
    /// TCP connect timeout (default: 5 seconds).
    pub connect_timeout: Duration,
    /// Handshake timeout covering the full startup exchange (default: 5 seconds).
    pub handshake_timeout: Duration,
    /// Default per-request deadline when the caller supplies none
    /// (default: 10 seconds).
    pub request_timeout: Duration,
    /// Retry behavior.
    pub retry: RetryConfig,
    /// Speculative execution behavior.
    pub speculative: SpeculativeConfig,
    /// Pool-wide admission control.
    pub backpressure: BackpressureConfig,
    /// Body compression negotiated at startup (default: none).
    pub compression: Compression,
    /// Maximum accepted frame body length (default: 16 MiB).
    pub max_frame_len: usize,
    /// Optional credentials for the authentication exchange.
    pub credentials: Option<Credentials>,
    /// Node-ordering policy for request routing (default: token-aware).
    pub policy: LoadBalancingPolicy,
    /// Consecutive connect failures before a node is marked unreachable
    /// (default: 3).
    pub failure_threshold: u32,
    /// Register connections for server topology/status events (default: true).
    pub register_for_events: bool,
    /// Poll interval while waiting for in-flight requests during drain
    /// (default: 100ms).
    pub drain_check_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            min_connections_per_node: 1,
            max_connections_per_node: 4,
            max_inflight_per_connection: 1024,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            speculative: SpeculativeConfig::default(),
            backpressure: BackpressureConfig::default(),
            compression: Compression::None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            credentials: None,
            policy: LoadBalancingPolicy::default(),
            failure_threshold: 3,
            register_for_events: true,
            drain_check_interval: Duration::from_millis(100),
        }
    }
}

impl DriverConfig {
    /// Rejects configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_node == 0 {
            return Err(invalid("max_connections_per_node must be at least 1"));
        }
        if self.min_connections_per_node > self.max_connections_per_node {
            return Err(invalid(
                "min_connections_per_node exceeds max_connections_per_node",
            ));
        }
        if self.max_inflight_per_connection == 0 {
            return Err(invalid("max_inflight_per_connection must be at least 1"));
        }
        if self.max_frame_len == 0 {
            return Err(invalid("max_frame_len must be nonzero"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.backpressure.max_inflight == 0 {
            return Err(invalid("backpressure.max_inflight must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> DriverError {
    DriverError::Config {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = DriverConfig {
            min_connections_per_node: 8,
            max_connections_per_node: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DriverError::Config { .. })
        ));
    }

    #[test]
    fn test_zero_inflight_rejected() {
        let config = DriverConfig {
            max_inflight_per_connection: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "app".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("app"));
        assert!(!rendered.contains("hunter2"));
    }
}
