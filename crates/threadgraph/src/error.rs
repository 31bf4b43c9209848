//! Error types for the conversation graph memory

use thiserror::Error;

/// Result alias used across the crate
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Errors raised by the ingestion, maintenance and retrieval pipelines
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Missing or invalid configuration; fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A store operation failed
    #[error("store operation '{operation}' failed: {message}")]
    Store {
        /// Operation that failed
        operation: String,
        /// Underlying error message
        message: String,
        /// Whether a retry may succeed (contention, timeout, leader election)
        transient: bool,
    },

    /// A conversation turn could not be committed
    #[error("turn for thread '{thread_id}' was not saved after {attempts} attempt(s): {message}")]
    Persistence {
        /// Thread the batch belonged to
        thread_id: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last error observed
        message: String,
    },

    /// Vector search or query embedding failed
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The embedding provider failed or returned a bad shape
    #[error("embedding provider error: {0}")]
    Embedding(String),

    /// A tool result payload could not be interpreted
    #[error("malformed tool payload: {0}")]
    MalformedPayload(String),

    /// A single schema statement failed
    #[error("schema statement '{name}' failed: {message}")]
    Schema {
        /// Constraint or index name
        name: String,
        /// Underlying error message
        message: String,
    },

    /// Input validation failure
    #[error("invalid {field}: {constraint} (got {value})")]
    Validation {
        /// Offending field
        field: String,
        /// Violated constraint
        constraint: String,
        /// Value received
        value: String,
    },

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    /// Permanent store error
    pub fn store(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.to_string(),
            transient: false,
        }
    }

    /// Store error that is worth retrying
    pub fn transient(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.to_string(),
            transient: true,
        }
    }

    /// Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Validation error
    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
        }
    }

    /// Embedding provider error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { transient: true, .. })
    }
}
