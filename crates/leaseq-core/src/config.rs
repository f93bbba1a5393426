//! Worker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::OrderingRule;

/// Worker timing and claim policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delay between claim attempts while idle, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lease refresh period while a task is held, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Rule passed to `claim_next`.
    #[serde(default = "default_ordering")]
    pub ordering: OrderingRule,

    /// How long a losing activity may take to unwind before it is aborted.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

fn default_ordering() -> OrderingRule {
    OrderingRule::OldestFirst
}

fn default_cancel_grace() -> u64 {
    5000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            ordering: default_ordering(),
            cancel_grace_ms: default_cancel_grace(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
