//! Queue errors.

use thiserror::Error;

use crate::task::OrderingRule;

/// Boxed error type used for opaque backend and handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by a [`TaskStore`](crate::store::TaskStore).
#[derive(Debug, Error)]
pub enum QueueError {
    /// No claimable task exists right now.
    #[error("No task available")]
    NoTaskAvailable,

    /// The store does not implement the requested ordering rule.
    #[error("Unsupported ordering rule: {0}")]
    UnsupportedRule(OrderingRule),

    /// The task was already completed or cancelled.
    #[error("Task {0} is already finalized")]
    TaskConflict(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Backend failure, tagged with the store operation that hit it.
    #[error("Store error during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    /// Payload could not be encoded or decoded.
    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Wrap a backend error with the name of the failing operation.
    pub fn store(operation: &'static str, source: impl Into<BoxError>) -> Self {
        QueueError::Store {
            operation,
            source: source.into(),
        }
    }

    /// True for the expected "nothing to do" outcome of a claim.
    pub fn is_no_task(&self) -> bool {
        matches!(self, QueueError::NoTaskAvailable)
    }

    /// True when a finalize call lost against an earlier finalize.
    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueError::TaskConflict(_))
    }
}
