//! Worker engine: poll, lease, heartbeat and finalize.
//!
//! A [`Worker`] repeatedly claims one task from its store and holds the lease
//! while the handler runs. Inside a lease two activities share a child
//! [`CancellationToken`]:
//!
//! - the heartbeat loop, refreshing the lease every heartbeat interval;
//! - the handler, receiving the payload and the scope token.
//!
//! Whichever finishes first decides the outcome. The scope is then cancelled
//! and the other activity is given `cancel_grace` to unwind before it is
//! aborted, so nothing started for a lease outlives it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::handler::{HandlerError, TaskHandler};
use crate::store::TaskStore;
use crate::task::ClaimedTask;

/// Fatal worker outcomes.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to claim task: {0}")]
    Claim(#[source] QueueError),

    #[error("Heartbeat failed for task {task_id}: {source}")]
    Heartbeat {
        task_id: String,
        #[source]
        source: QueueError,
    },

    #[error("Handler failed for task {task_id}: {source}")]
    Handler {
        task_id: String,
        #[source]
        source: HandlerError,
    },

    #[error("Failed to cancel task {task_id} after the handler requested cancellation: {source}")]
    Cancel {
        task_id: String,
        #[source]
        source: QueueError,
    },

    #[error("Failed to complete task {task_id}: {source}")]
    Complete {
        task_id: String,
        #[source]
        source: QueueError,
    },

    #[error("Lease activity for task {task_id} did not finish cleanly: {message}")]
    Activity { task_id: String, message: String },
}

impl WorkerError {
    /// Identifier of the task held when the error happened.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WorkerError::Claim(_) => None,
            WorkerError::Heartbeat { task_id, .. }
            | WorkerError::Handler { task_id, .. }
            | WorkerError::Cancel { task_id, .. }
            | WorkerError::Complete { task_id, .. }
            | WorkerError::Activity { task_id, .. } => Some(task_id),
        }
    }
}

/// Counters for a single worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub cancelled: u64,
    /// A task is currently leased by this worker.
    pub busy: bool,
}

/// `tokio::time::interval` panics on a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

enum Activity {
    Heartbeat(Result<(), QueueError>),
    Handler(Result<(), HandlerError>),
}

enum LeaseOutcome {
    Finalized,
    Interrupted,
}

/// Polls a store and runs claimed tasks through a handler.
pub struct Worker<S> {
    store: Arc<S>,
    config: WorkerConfig,
    claimed: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    busy: AtomicBool,
}

impl<S> Worker<S>
where
    S: TaskStore + 'static,
{
    /// Create a new worker.
    pub fn new(store: Arc<S>, config: WorkerConfig) -> Self {
        Self {
            store,
            config,
            claimed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            busy: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Snapshot of the worker counters.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            claimed: self.claimed.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            busy: self.busy.load(Ordering::SeqCst),
        }
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    ///
    /// Returns `Ok(())` on shutdown. A task leased when shutdown fires is left
    /// unfinalized and becomes claimable again once its lease expires.
    pub async fn run<H>(&self, handler: Arc<H>, shutdown: CancellationToken) -> Result<(), WorkerError>
    where
        H: TaskHandler<S::Payload> + 'static,
    {
        info!(
            ordering = %self.config.ordering,
            poll_interval_ms = self.config.poll_interval_ms,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            "Worker started"
        );

        let result = self.poll_loop(&handler, &shutdown).await;

        match &result {
            Ok(()) => info!("Worker stopped"),
            Err(e) => warn!(error = %e, task_id = ?e.task_id(), "Worker stopped on fatal error"),
        }
        result
    }

    async fn poll_loop<H>(&self, handler: &Arc<H>, shutdown: &CancellationToken) -> Result<(), WorkerError>
    where
        H: TaskHandler<S::Payload> + 'static,
    {
        let mut ticker = tokio::time::interval(self.config.poll_interval().max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let claimed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                claimed = self.store.claim_next(self.config.ordering) => claimed,
            };
            let task = match claimed {
                Ok(task) => task,
                Err(QueueError::NoTaskAvailable) => continue,
                Err(e) => return Err(WorkerError::Claim(e)),
            };

            self.claimed.fetch_add(1, Ordering::SeqCst);
            self.busy.store(true, Ordering::SeqCst);
            debug!(task_id = %task.id, "Claimed task");

            let outcome = self.hold_lease(task, handler, shutdown).await;
            self.busy.store(false, Ordering::SeqCst);

            match outcome? {
                LeaseOutcome::Finalized => {}
                LeaseOutcome::Interrupted => return Ok(()),
            }
        }
    }

    async fn hold_lease<H>(
        &self,
        task: ClaimedTask<S::Id, S::Payload>,
        handler: &Arc<H>,
        shutdown: &CancellationToken,
    ) -> Result<LeaseOutcome, WorkerError>
    where
        H: TaskHandler<S::Payload> + 'static,
    {
        let ClaimedTask { id, payload } = task;
        let scope = shutdown.child_token();
        let mut activities = JoinSet::new();

        let store = self.store.clone();
        let beat_id = id.clone();
        let period = self.config.heartbeat_interval().max(MIN_INTERVAL);
        let beat_scope = scope.clone();
        activities.spawn(async move {
            Activity::Heartbeat(heartbeat_loop(store, beat_id, period, beat_scope).await)
        });

        let span = info_span!("task", task_id = %id);
        let handler = handler.clone();
        let handler_scope = scope.clone();
        activities.spawn(
            async move { Activity::Handler(handler.handle(payload, handler_scope).await) }
                .instrument(span),
        );

        let first = activities.join_next().await;
        // Only a shutdown seen before the first result interrupts the lease.
        let interrupted = shutdown.is_cancelled();
        scope.cancel();
        drain(&mut activities, self.config.cancel_grace(), &id).await;

        if interrupted {
            info!(task_id = %id, "Shutdown during lease, leaving task unfinalized");
            return Ok(LeaseOutcome::Interrupted);
        }

        let activity = match first {
            Some(Ok(activity)) => activity,
            Some(Err(join_err)) => return Err(activity_error(&id, join_err)),
            None => {
                return Err(WorkerError::Activity {
                    task_id: id.to_string(),
                    message: "no lease activity ran".to_string(),
                });
            }
        };

        self.finalize(&id, activity, shutdown).await
    }

    async fn finalize(
        &self,
        id: &S::Id,
        activity: Activity,
        shutdown: &CancellationToken,
    ) -> Result<LeaseOutcome, WorkerError> {
        match activity {
            Activity::Handler(Ok(())) => {
                let completed = tokio::select! {
                    biased;
                    completed = self.store.complete(id) => completed,
                    _ = shutdown.cancelled() => return Ok(abandoned(id)),
                };
                completed.map_err(|source| WorkerError::Complete {
                    task_id: id.to_string(),
                    source,
                })?;
                self.completed.fetch_add(1, Ordering::SeqCst);
                debug!(task_id = %id, "Completed task");
                Ok(LeaseOutcome::Finalized)
            }
            Activity::Handler(Err(HandlerError::Cancel)) => {
                let cancelled = tokio::select! {
                    biased;
                    cancelled = self.store.cancel(id) => cancelled,
                    _ = shutdown.cancelled() => return Ok(abandoned(id)),
                };
                cancelled.map_err(|source| WorkerError::Cancel {
                    task_id: id.to_string(),
                    source,
                })?;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                debug!(task_id = %id, "Cancelled task");
                Ok(LeaseOutcome::Finalized)
            }
            Activity::Handler(Err(source)) => Err(WorkerError::Handler {
                task_id: id.to_string(),
                source,
            }),
            Activity::Heartbeat(Err(source)) => Err(WorkerError::Heartbeat {
                task_id: id.to_string(),
                source,
            }),
            // The heartbeat loop only returns Ok once the scope is cancelled,
            // which before finalization means shutdown.
            Activity::Heartbeat(Ok(())) => Err(WorkerError::Activity {
                task_id: id.to_string(),
                message: "heartbeat stopped before the handler finished".to_string(),
            }),
        }
    }
}

async fn heartbeat_loop<S>(
    store: Arc<S>,
    id: S::Id,
    period: Duration,
    scope: CancellationToken,
) -> Result<(), QueueError>
where
    S: TaskStore + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                tokio::select! {
                    beat = store.heartbeat(&id) => beat?,
                    _ = scope.cancelled() => return Ok(()),
                }
                debug!(task_id = %id, "Heartbeat");
            }
        }
    }
}

/// Shutdown fired while a finalize call was in flight. The lease expires and
/// the task is claimed again.
fn abandoned<I: std::fmt::Display>(id: &I) -> LeaseOutcome {
    info!(task_id = %id, "Shutdown during finalize, abandoning lease");
    LeaseOutcome::Interrupted
}

/// Wait for the remaining activities, aborting them after `grace`.
async fn drain<I: std::fmt::Display>(activities: &mut JoinSet<Activity>, grace: Duration, id: &I) {
    let unwind = async { while activities.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, unwind).await.is_err() {
        warn!(task_id = %id, grace_ms = grace.as_millis() as u64, "Lease activity ignored cancellation, aborting");
        activities.shutdown().await;
    }
}

fn activity_error<I: std::fmt::Display>(id: &I, err: JoinError) -> WorkerError {
    let message = if err.is_panic() {
        "activity panicked".to_string()
    } else {
        err.to_string()
    };
    WorkerError::Activity {
        task_id: id.to_string(),
        message,
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
