//! Task store contract and the in-memory store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::task::{ClaimedTask, OrderingRule, TaskRecord};

/// Persistence boundary for tasks.
///
/// Claim, heartbeat and the two finalize operations must each be a single
/// atomic step against the backend. Splitting "is it claimable" from "mark it
/// leased" would let two workers own the same task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Caller-defined task content.
    type Payload: Send + 'static;

    /// Store-assigned task identifier.
    type Id: Clone + fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Provision whatever the store needs. Safe to call more than once.
    async fn init(&self) -> Result<(), QueueError>;

    /// Persist a new pending task.
    async fn create(&self, payload: Self::Payload) -> Result<(), QueueError>;

    /// Lease the next claimable task according to `rule`.
    ///
    /// Returns [`QueueError::NoTaskAvailable`] when nothing is claimable and
    /// [`QueueError::UnsupportedRule`] for rules the store does not implement.
    async fn claim_next(
        &self,
        rule: OrderingRule,
    ) -> Result<ClaimedTask<Self::Id, Self::Payload>, QueueError>;

    /// Refresh the lease on a task. Does not look at finalization state.
    async fn heartbeat(&self, id: &Self::Id) -> Result<(), QueueError>;

    /// Mark a task completed. [`QueueError::TaskConflict`] if already finalized.
    async fn complete(&self, id: &Self::Id) -> Result<(), QueueError>;

    /// Mark a task cancelled. [`QueueError::TaskConflict`] if already finalized.
    async fn cancel(&self, id: &Self::Id) -> Result<(), QueueError>;
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    type Payload = S::Payload;
    type Id = S::Id;

    async fn init(&self) -> Result<(), QueueError> {
        (**self).init().await
    }

    async fn create(&self, payload: Self::Payload) -> Result<(), QueueError> {
        (**self).create(payload).await
    }

    async fn claim_next(
        &self,
        rule: OrderingRule,
    ) -> Result<ClaimedTask<Self::Id, Self::Payload>, QueueError> {
        (**self).claim_next(rule).await
    }

    async fn heartbeat(&self, id: &Self::Id) -> Result<(), QueueError> {
        (**self).heartbeat(id).await
    }

    async fn complete(&self, id: &Self::Id) -> Result<(), QueueError> {
        (**self).complete(id).await
    }

    async fn cancel(&self, id: &Self::Id) -> Result<(), QueueError> {
        (**self).cancel(id).await
    }
}

struct MemoryState<T> {
    tasks: BTreeMap<u64, TaskRecord<T>>,
    next_id: u64,
}

/// In-memory task store.
///
/// A single mutex guards every record, so each operation is atomic with
/// respect to the others. Identifiers start at 1.
pub struct MemoryTaskStore<T> {
    state: Mutex<MemoryState<T>>,
    safe_window: Duration,
    clock: Arc<dyn Clock>,
}

impl<T> MemoryTaskStore<T> {
    /// Create a store whose leases expire after `safe_window` of silence.
    pub fn new(safe_window: Duration) -> Self {
        Self::with_clock(safe_window, Arc::new(SystemClock))
    }

    /// Create a store with a custom time source.
    pub fn with_clock(safe_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                tasks: BTreeMap::new(),
                next_id: 1,
            }),
            safe_window,
            clock,
        }
    }

    /// Lease expiry window.
    pub fn safe_window(&self) -> Duration {
        self.safe_window
    }

    /// Number of tasks ever created.
    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    /// Check if the store holds no tasks.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.tasks.is_empty()
    }
}

impl<T: Clone> MemoryTaskStore<T> {
    /// Snapshot of a task record.
    pub async fn get(&self, id: u64) -> Option<TaskRecord<T>> {
        self.state.lock().await.tasks.get(&id).cloned()
    }
}

#[derive(Debug, Clone, Copy)]
enum Finalize {
    Complete,
    Cancel,
}

impl<T> MemoryTaskStore<T> {
    async fn finalize(&self, id: u64, action: Finalize) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))?;

        if record.is_finalized() {
            return Err(QueueError::TaskConflict(id.to_string()));
        }

        match action {
            Finalize::Complete => record.completed_at = Some(now),
            Finalize::Cancel => record.cancelled_at = Some(now),
        }
        debug!(task_id = id, ?action, "Finalized task");
        Ok(())
    }
}

#[async_trait]
impl<T> TaskStore for MemoryTaskStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Payload = T;
    type Id = u64;

    async fn init(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn create(&self, payload: T) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(id, TaskRecord::new(payload, now));
        debug!(task_id = id, "Created task");
        Ok(())
    }

    async fn claim_next(&self, rule: OrderingRule) -> Result<ClaimedTask<u64, T>, QueueError> {
        if rule != OrderingRule::OldestFirst {
            return Err(QueueError::UnsupportedRule(rule));
        }

        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let id = state
            .tasks
            .iter()
            .filter(|(_, record)| record.is_claimable(now, self.safe_window))
            .min_by_key(|(id, record)| (record.created_at, **id))
            .map(|(id, _)| *id)
            .ok_or(QueueError::NoTaskAvailable)?;

        let record = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))?;
        record.leased_at = Some(now);

        debug!(task_id = id, %rule, "Claimed task");
        Ok(ClaimedTask::new(id, record.payload.clone()))
    }

    async fn heartbeat(&self, id: &u64) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))?;
        record.leased_at = Some(now);
        Ok(())
    }

    async fn complete(&self, id: &u64) -> Result<(), QueueError> {
        self.finalize(*id, Finalize::Complete).await
    }

    async fn cancel(&self, id: &u64) -> Result<(), QueueError> {
        self.finalize(*id, Finalize::Cancel).await
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
