//! Error types for adi-state

use thiserror::Error;

/// Errors surfaced by an [`crate::ExecutionStore`] backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No record with this execution id
    #[error("execution not found: {execution_id}")]
    NotFound { execution_id: String },

    /// A record with this execution id already exists
    #[error("execution already exists: {execution_id}")]
    Duplicate { execution_id: String },

    /// Transition rejected by the state machine (e.g. out of a terminal state)
    #[error("invalid transition for {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: String,
        from: String,
        to: String,
    },

    /// Backend connection or query failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Record could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True when the write was refused because the record is already terminal.
    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, StorageError::InvalidTransition { from, .. } if from == "completed" || from == "failed")
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
