//! Handler contract for claimed tasks.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// Outcome of a handler other than success.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler asks for the task to be cancelled.
    #[error("Task cancellation requested by handler")]
    Cancel,

    /// Any other failure. Fatal to the worker; the task stays leased.
    #[error("Handler failed: {0}")]
    Failed(#[source] BoxError),
}

impl HandlerError {
    /// Wrap an arbitrary error as a handler failure.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        HandlerError::Failed(err.into())
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, HandlerError::Cancel)
    }
}

/// Processes the payload of a claimed task.
///
/// `cancel` fires when the lease scope ends early: a heartbeat failed or the
/// worker is shutting down. Handlers should stop promptly once it fires.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    async fn handle(&self, payload: T, cancel: CancellationToken) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> TaskHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: T, cancel: CancellationToken) -> Result<(), HandlerError> {
        (self)(payload, cancel).await
    }
}
