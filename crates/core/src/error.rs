//! Core error types for keel domain operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for domain parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A resource carries a kind tag no driver is registered for.
    #[error("Unknown kind: {kind}")]
    UnknownKind { kind: String },

    /// A desired-state tag could not be parsed.
    #[error("unknown desired state '{state}'")]
    UnknownDesiredState { state: String },

    /// A status-state tag could not be parsed.
    #[error("unknown status state '{state}'")]
    UnknownStatusState { state: String },
}

impl Error {
    /// Create an unknown kind error.
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Create an unknown desired state error.
    pub fn unknown_desired_state(state: impl Into<String>) -> Self {
        Self::UnknownDesiredState {
            state: state.into(),
        }
    }

    /// Create an unknown status state error.
    pub fn unknown_status_state(state: impl Into<String>) -> Self {
        Self::UnknownStatusState {
            state: state.into(),
        }
    }
}
