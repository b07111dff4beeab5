//! Error types for perpetual channels
//!
//! This module contains every error surfaced by the core: the `SocketError`
//! taxonomy used for connection and channel failures, the `ConfigError`
//! returned by construction-time validation and the `WorkerError` produced by
//! the sequential worker when a task cannot complete.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Close Codes
// ----------------------------------------------------------------------------

/// Close code used for every graceful, locally initiated close
pub const NORMAL_CLOSURE: u16 = 1000;

/// Reason used when a connection walks past the last handler stage
pub const END_OF_HANDLER_CHAIN: &str = "End of HandlerChain";

// ----------------------------------------------------------------------------
// Socket Errors
// ----------------------------------------------------------------------------

/// Failures observed on a connection or a channel
///
/// The value is cloneable because a single close reason is handed to every
/// send future still pending when the connection goes away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("Initialization timeout")]
    InitializationTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SocketError {
    /// Build a graceful close reason
    pub fn closed(code: u16, reason: impl Into<String>) -> Self {
        SocketError::Closed {
            code,
            reason: reason.into(),
        }
    }

    /// Build a transport/IO failure
    pub fn connection(reason: impl Into<String>) -> Self {
        SocketError::Connection(reason.into())
    }

    /// Build an illegal state error
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        SocketError::IllegalState(reason.into())
    }

    /// Close code to put on the wire when closing for this reason
    pub fn close_code(&self) -> u16 {
        match self {
            SocketError::Closed { code, .. } => *code,
            _ => NORMAL_CLOSURE,
        }
    }

    /// Human readable close reason to put on the wire
    pub fn close_reason(&self) -> String {
        match self {
            SocketError::Closed { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this is a graceful close rather than a failure
    pub fn is_graceful(&self) -> bool {
        matches!(self, SocketError::Closed { code, .. } if *code == NORMAL_CLOSURE)
    }
}

impl From<serde_json::Error> for SocketError {
    fn from(err: serde_json::Error) -> Self {
        SocketError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        SocketError::Connection(format!("IO error: {}", err))
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Construction-time misconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be a positive duration")]
    InvalidDuration { field: &'static str },

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

// ----------------------------------------------------------------------------
// Worker Errors
// ----------------------------------------------------------------------------

/// Reasons a task submitted to a sequential worker produced no value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("Worker retired before the task could run")]
    Retired,

    #[error("Task panicked")]
    Panicked,
}

/// Result type for socket operations
pub type SocketResult<T> = std::result::Result<T, SocketError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_and_reason() {
        let graceful = SocketError::closed(NORMAL_CLOSURE, END_OF_HANDLER_CHAIN);
        assert_eq!(graceful.close_code(), 1000);
        assert_eq!(graceful.close_reason(), "End of HandlerChain");
        assert!(graceful.is_graceful());

        let remote = SocketError::closed(1011, "server restarting");
        assert_eq!(remote.close_code(), 1011);
        assert!(!remote.is_graceful());

        assert_eq!(SocketError::ReadTimeout.close_code(), NORMAL_CLOSURE);
        assert_eq!(SocketError::ReadTimeout.close_reason(), "Read timeout");
    }

    #[test]
    fn test_error_display() {
        let err = SocketError::connection("broken pipe");
        assert_eq!(err.to_string(), "Connection error: broken pipe");

        let err = ConfigError::InvalidDuration {
            field: "shift_duration",
        };
        assert_eq!(err.to_string(), "shift_duration must be a positive duration");
    }
}
