//! Persistence errors for the keel store.

use std::fmt;

use thiserror::Error;

/// Errors that can occur during persistence operations.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// Store unreachable or timed out
    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("record not found: {entity_type} with id '{id}'")]
    NotFound { entity_type: String, id: String },

    #[error("record already exists: {entity_type} with id '{id}'")]
    AlreadyExists { entity_type: String, id: String },

    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// Write conflict with another worker; the claim or update lost the race
    #[error("transaction failed: {reason}")]
    TransactionFailed { reason: String },
}

impl PersistenceError {
    pub fn query_failed(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn already_exists(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Check if error reports a lost write race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::TransactionFailed { .. })
    }
}

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Categorize a SurrealDB error by its message.
pub fn from_surrealdb_error(err: impl fmt::Display) -> PersistenceError {
    let reason = err.to_string();
    let lower = reason.to_lowercase();

    if lower.contains("conflict") || lower.contains("can be retried") {
        PersistenceError::TransactionFailed { reason }
    } else if lower.contains("timeout") || lower.contains("connect") {
        PersistenceError::ConnectionFailed { reason }
    } else if lower.contains("already exists") || lower.contains("duplicate") {
        PersistenceError::already_exists("unknown", reason)
    } else if lower.contains("not found") || lower.contains("does not exist") {
        PersistenceError::not_found("unknown", reason)
    } else if lower.contains("serializ") {
        PersistenceError::SerializationError { reason }
    } else {
        PersistenceError::QueryFailed { reason }
    }
}
