//! Driver error taxonomy.
//!
//! Connection-local failures (`FrameCorruption`, `ProtocolViolation`,
//! `ConnectionLost`) are contained by closing and reopening the connection.
//! Request-local failures surface to the caller only after the retry and
//! speculation budgets are exhausted, always as one of these classified
//! variants, never as a raw transport error.

use thiserror::Error;

/// Errors produced by the driver core.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Malformed bytes on the wire. The connection is closed, never resynced.
    #[error("corrupt frame: {reason}")]
    FrameCorruption {
        /// What made the frame undecodable.
        reason: String,
    },

    /// The peer broke the framing contract (unmatched stream id, unexpected
    /// opcode). Surfaced as a driver-visible bug; the connection is closed.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violated contract.
        reason: String,
    },

    /// I/O failure or peer close. All pending requests on the connection
    /// resolve with this error and reconnection is scheduled.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Underlying cause.
        reason: String,
    },

    /// Stream ids or admission slots exhausted. A deliberate signal, not a
    /// fault; callers queue or reroute per policy.
    #[error("backpressure: {reason}")]
    Backpressure {
        /// Which limit pushed back.
        reason: String,
    },

    /// Request deadline elapsed before a response arrived.
    #[error("request timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed since submission.
        elapsed_ms: u64,
    },

    /// Application-level error from the remote node that is eligible for
    /// retry or rerouting (overloaded, unavailable, bootstrapping).
    #[error("recoverable server error {code}: {message}")]
    RecoverableServerError {
        /// Wire error code.
        code: ServerErrorCode,
        /// Server-provided message.
        message: String,
    },

    /// Application-level error from the remote node that must be propagated
    /// as-is (syntax error, unauthorized, invalid request).
    #[error("server error {code}: {message}")]
    UnrecoverableServerError {
        /// Wire error code.
        code: ServerErrorCode,
        /// Server-provided message.
        message: String,
    },

    /// Connection attempt did not complete within the configured timeout.
    #[error("connect timeout after {timeout_ms}ms to {addr}")]
    ConnectTimeout {
        /// Target address.
        addr: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The request was cancelled by the caller before resolution.
    #[error("request cancelled")]
    Cancelled,

    /// No candidate nodes remain for routing.
    #[error("no nodes available for routing")]
    NoNodesAvailable,

    /// Invalid configuration value.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What was rejected.
        reason: String,
    },

    /// A driver-internal invariant was broken (double release of a stream
    /// id, double resolution of a pending slot). Always a bug, never a
    /// normal runtime condition.
    #[error("internal invariant violated: {reason}")]
    InvariantViolation {
        /// The broken invariant.
        reason: String,
    },

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the driver.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Application-level error codes carried in ERROR frame bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ServerErrorCode {
    ServerError = 0x0000,
    ProtocolError = 0x000A,
    BadCredentials = 0x0100,
    Unavailable = 0x1000,
    Overloaded = 0x1001,
    IsBootstrapping = 0x1002,
    TruncateError = 0x1003,
    WriteTimeout = 0x1100,
    ReadTimeout = 0x1200,
    SyntaxError = 0x2000,
    Unauthorized = 0x2100,
    Invalid = 0x2200,
    ConfigError = 0x2300,
    AlreadyExists = 0x2400,
    Unprepared = 0x2500,
}

impl ServerErrorCode {
    /// Maps a wire code to a known variant, defaulting to `ServerError`
    /// for codes this driver does not recognize.
    pub fn from_code(code: i32) -> Self {
        match code {
            0x000A => ServerErrorCode::ProtocolError,
            0x0100 => ServerErrorCode::BadCredentials,
            0x1000 => ServerErrorCode::Unavailable,
            0x1001 => ServerErrorCode::Overloaded,
            0x1002 => ServerErrorCode::IsBootstrapping,
            0x1003 => ServerErrorCode::TruncateError,
            0x1100 => ServerErrorCode::WriteTimeout,
            0x1200 => ServerErrorCode::ReadTimeout,
            0x2000 => ServerErrorCode::SyntaxError,
            0x2100 => ServerErrorCode::Unauthorized,
            0x2200 => ServerErrorCode::Invalid,
            0x2300 => ServerErrorCode::ConfigError,
            0x2400 => ServerErrorCode::AlreadyExists,
            0x2500 => ServerErrorCode::Unprepared,
            _ => ServerErrorCode::ServerError,
        }
    }

    /// Whether a request failing with this code may be retried, possibly on
    /// a different node. Coordinator-side timeouts are retryable because a
    /// replica may still answer elsewhere; request-shape errors are not.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ServerErrorCode::Overloaded
                | ServerErrorCode::Unavailable
                | ServerErrorCode::IsBootstrapping
                | ServerErrorCode::ReadTimeout
                | ServerErrorCode::WriteTimeout
        )
    }
}

impl std::fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", *self as i32)
    }
}

impl DriverError {
    /// Builds the classified error for an ERROR frame body.
    pub fn from_server_error(code: i32, message: String) -> Self {
        let code = ServerErrorCode::from_code(code);
        if code.is_recoverable() {
            DriverError::RecoverableServerError { code, message }
        } else {
            DriverError::UnrecoverableServerError { code, message }
        }
    }
}
