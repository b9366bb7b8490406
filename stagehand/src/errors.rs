//! Error types for the stagehand engine.
//!
//! Infrastructure failures (repository, queue, lock) are typed so the
//! dispatcher can tell them apart from task-level failures, which are
//! classified separately by [`crate::exceptions`].

use crate::core::ExecutionType;
use thiserror::Error;

/// The main error type for engine operations.
///
/// A handler returning this error leaves its queue delivery unacked, so the
/// message is redelivered once the ack timeout expires.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The execution repository failed.
    #[error("{0}")]
    Repository(#[from] RepositoryError),

    /// The queue transport failed.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// The cluster lock failed.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// Invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An execution definition is invalid.
    #[error("Invalid execution: {0}")]
    Validation(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by an execution repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No execution with the given id exists.
    #[error("No {execution_type} found for {id}")]
    NotFound {
        /// The execution type that was looked up.
        execution_type: ExecutionType,
        /// The execution id.
        id: String,
    },

    /// The execution exists but has no stage with the given id.
    #[error("No stage {stage_id} found in execution {execution_id}")]
    StageNotFound {
        /// The execution id.
        execution_id: String,
        /// The stage id.
        stage_id: String,
    },

    /// An execution with the same id already exists.
    #[error("Execution {0} already exists")]
    Duplicate(String),

    /// The execution is owned by another partition.
    #[error("Execution {id} belongs to partition {partition}, this instance handles {local_partition}")]
    ForeignExecution {
        /// The execution id.
        id: String,
        /// The partition that owns the execution.
        partition: String,
        /// The partition this repository handles.
        local_partition: String,
    },

    /// The backing store is unreachable or failed.
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(execution_type: ExecutionType, id: impl Into<String>) -> Self {
        Self::NotFound {
            execution_type,
            id: id.into(),
        }
    }

    /// Returns true if this error means the record does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised by a queue transport.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The receipt does not match an in-flight delivery.
    #[error("Unknown receipt: {0}")]
    UnknownReceipt(String),

    /// The transport is unreachable or failed.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a cluster lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lease is not held by the caller.
    #[error("Lease on {key} is not held by {owner}")]
    NotOwner {
        /// The lock key.
        key: String,
        /// The owner token presented.
        owner: String,
    },

    /// The lock backend is unreachable or failed.
    #[error("Lock manager unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A configuration value is out of range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Errors raised by the compound execution operator.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// The execution is owned by another partition.
    #[error("Execution {id} is owned by partition {partition:?}, not {local_partition:?}")]
    ForeignExecution {
        /// The execution id.
        id: String,
        /// The execution's partition.
        partition: Option<String>,
        /// The partition this operator handles.
        local_partition: Option<String>,
    },

    /// The requested transition is not valid for the current state.
    #[error("Invalid state for {operation}: {reason}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// An engine error occurred while applying the operation.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

impl From<RepositoryError> for OperatorError {
    fn from(err: RepositoryError) -> Self {
        Self::Engine(EngineError::Repository(err))
    }
}

impl From<QueueError> for OperatorError {
    fn from(err: QueueError) -> Self {
        Self::Engine(EngineError::Queue(err))
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Engine(EngineError::Serialization(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = RepositoryError::not_found(ExecutionType::Pipeline, "01H");
        assert_eq!(err.to_string(), "No pipeline found for 01H");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_engine_error_from_repository() {
        let err: EngineError = RepositoryError::Unavailable("down".to_string()).into();
        assert!(matches!(err, EngineError::Repository(_)));
        assert_eq!(err.to_string(), "Repository unavailable: down");
    }

    #[test]
    fn test_operator_error_wraps_queue_error() {
        let err: OperatorError = QueueError::Unavailable("gone".to_string()).into();
        assert!(matches!(err, OperatorError::Engine(EngineError::Queue(_))));
    }
}
