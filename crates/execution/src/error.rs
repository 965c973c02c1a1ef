//! Error taxonomy for the execution layer.

use std::time::Duration;

use relay_core::ConfigError;
use relay_storage::StorageError;

/// Result alias for execution operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors raised synchronously by the scheduler, the concurrency manager and
/// the chain executor.
///
/// Handler failures are not here: they are captured on the execution record
/// and never returned from these APIs.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Unknown task, execution, chain run or chain node
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing required fields or a malformed chain
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Chain dependencies contain a cycle
    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    /// Cancelling something that already finished
    #[error("Cannot cancel {id}: already {status}")]
    CancellationConflict {
        /// What was being cancelled
        id: String,
        /// Its terminal status
        status: String,
    },

    /// Asking for the result of an execution that did not complete
    #[error("Execution {id} has no result: status is {status}")]
    NotCompleted {
        /// Execution id
        id: String,
        /// Current status
        status: String,
    },

    /// Waiting for an execution to finish exceeded its bound
    #[error("Timed out after {timeout:?} waiting for {id}")]
    AdmissionTimeout {
        /// What was being waited on
        id: String,
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// A queued request was removed before admission
    #[error("Request {0} was cancelled")]
    Cancelled(String),

    /// Draining the concurrency manager exceeded its bound
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Durability layer failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
}

impl From<ConfigError> for ExecutionError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidConfiguration(e.to_string())
    }
}
