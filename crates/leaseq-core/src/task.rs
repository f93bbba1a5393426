//! Task definition, lease state and ordering rules.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Policy a store uses to pick the next claimable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingRule {
    /// Zero value. No store implements it.
    #[serde(skip)]
    Unspecified,
    /// Oldest claimable task by creation time first.
    #[serde(alias = "fifo")]
    OldestFirst,
}

impl OrderingRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderingRule::Unspecified => "unspecified",
            OrderingRule::OldestFirst => "oldest_first",
        }
    }
}

impl fmt::Display for OrderingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task handed out by `claim_next`, leased to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask<I, T> {
    /// Store-assigned identifier.
    pub id: I,
    /// Payload as it was created.
    pub payload: T,
}

impl<I, T> ClaimedTask<I, T> {
    pub fn new(id: I, payload: T) -> Self {
        Self { id, payload }
    }
}

/// A task as held by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord<T> {
    /// Task payload.
    pub payload: T,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last claim or heartbeat.
    pub leased_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Cancellation time.
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl<T> TaskRecord<T> {
    /// Create a pending record.
    pub fn new(payload: T, created_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            created_at,
            leased_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    /// Completed or cancelled.
    pub fn is_finalized(&self) -> bool {
        self.completed_at.is_some() || self.cancelled_at.is_some()
    }

    /// Whether the lease on this task has lapsed at `now`.
    ///
    /// Expiry is strict: a lease exactly `window` old is still held.
    pub fn lease_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.leased_at {
            None => true,
            Some(leased_at) => match chrono::Duration::from_std(window) {
                Ok(window) => now.signed_duration_since(leased_at) > window,
                Err(_) => false,
            },
        }
    }

    /// Eligible for `claim_next`.
    pub fn is_claimable(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.is_finalized() && self.lease_expired(now, window)
    }
}
