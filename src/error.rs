//! # Error Types
//!
//! Crate-wide error handling using thiserror. [`ServerError`] is what every
//! subsystem returns; [`BrokerError`] carries the numeric protocol code from the
//! message broker so consumer loops can tell group churn apart from real failures.

use std::time::Duration;
use thiserror::Error;

/// Broker protocol code: the generation id sent by the member is stale.
pub const ILLEGAL_GENERATION: i16 = 22;
/// Broker protocol code: the coordinator does not know this member id.
pub const UNKNOWN_MEMBER_ID: i16 = 25;
/// Broker protocol code: the group is rebalancing.
pub const REBALANCE_IN_PROGRESS: i16 = 27;

/// Protocol codes that signal normal consumer-group churn.
pub const IGNORABLE_PROTOCOL_CODES: [i16; 3] =
    [ILLEGAL_GENERATION, UNKNOWN_MEMBER_ID, REBALANCE_IN_PROGRESS];

/// Failures reported by a broker client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker protocol error {code}: {message}")]
    Protocol { code: i16, message: String },

    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Broker client disconnected")]
    Disconnected,

    #[error("Broker error: {message}")]
    Other { message: String },
}

impl BrokerError {
    pub fn protocol(code: i16, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Numeric protocol code, if the broker sent one
    pub fn code(&self) -> Option<i16> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Consumer-group churn that should be counted and retried, never escalated
    pub fn is_ignorable(&self) -> bool {
        self.code()
            .map(|code| IGNORABLE_PROTOCOL_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// The broker is momentarily unreachable
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid capability set: {0}")]
    InvalidCapabilities(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ServerError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    /// Infrastructure that is momentarily unreachable and worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DatabaseUnavailable(_) | Self::Timeout { .. } => true,
            Self::Broker(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ServerError::DatabaseUnavailable(err.to_string())
            }
            sqlx::Error::Configuration(e) => ServerError::Configuration(e.to_string()),
            other => ServerError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        ServerError::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_churn_codes_are_ignorable() {
        for code in IGNORABLE_PROTOCOL_CODES {
            assert!(BrokerError::protocol(code, "churn").is_ignorable());
        }
        assert!(!BrokerError::protocol(3, "unknown topic").is_ignorable());
        assert!(!BrokerError::unavailable("down").is_ignorable());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ServerError::DatabaseUnavailable("refused".into()).is_transient());
        assert!(ServerError::from(BrokerError::unavailable("down")).is_transient());
        assert!(!ServerError::processing("bad payload").is_transient());
        assert!(!ServerError::from(BrokerError::protocol(27, "rebalance")).is_transient());
    }

    #[test]
    fn test_timeout_display() {
        let err = ServerError::timeout("broadcast reloadPlugins", Duration::from_secs(5));
        assert_eq!(
            err.to_string(),
            "Operation broadcast reloadPlugins timed out after 5000ms"
        );
    }
}
