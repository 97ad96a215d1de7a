//! Error types for the reconciler crate.

use keel_store::PersistenceError;
use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// The `Display` output of every variant is what ends up in the status
/// message of a failed resource, so messages are written for operators.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The resource carries a kind tag outside the closed set of kinds.
    #[error("Unknown kind: {kind}")]
    UnknownKind { kind: String },

    /// A driver reported an infrastructure failure.
    #[error("{kind} driver failed: {reason}")]
    DriverFailed { kind: String, reason: String },

    /// A driver did not return within the configured timeout.
    #[error("{kind} driver timed out after {timeout_ms}ms")]
    DriverTimeout { kind: String, timeout_ms: u64 },

    /// The finalizer hook refused the attempt.
    #[error("finalizer failed: {reason}")]
    FinalizerFailed { reason: String },

    /// A stored record could not be interpreted.
    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    /// Repository failure.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A background loop ended abnormally.
    #[error("task failed: {reason}")]
    TaskFailed { reason: String },
}

impl Error {
    /// Create an unknown kind error.
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Create a driver failed error.
    pub fn driver_failed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DriverFailed {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create a driver timeout error.
    pub fn driver_timeout(kind: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::DriverTimeout {
            kind: kind.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a finalizer failed error.
    pub fn finalizer_failed(reason: impl Into<String>) -> Self {
        Self::FinalizerFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a task failed error.
    pub fn task_failed(reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            reason: reason.into(),
        }
    }

}

impl From<keel_core::Error> for Error {
    fn from(err: keel_core::Error) -> Self {
        match err {
            keel_core::Error::UnknownKind { kind } => Self::UnknownKind { kind },
            other => Self::InvalidRecord {
                reason: other.to_string(),
            },
        }
    }
}
