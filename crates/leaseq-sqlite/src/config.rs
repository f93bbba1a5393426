//! SQLite store configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the task table lives and how leases expire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Database file. `None` keeps the queue in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Safe window: a lease older than this is expired.
    #[serde(default = "default_lease_window")]
    pub lease_window_ms: u64,

    /// Connections opened against a file database.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long a connection waits on a locked database.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_lease_window() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    4
}

fn default_busy_timeout() -> u64 {
    5000
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            lease_window_ms: default_lease_window(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl SqliteStoreConfig {
    /// File-backed configuration with default timings.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn lease_window(&self) -> Duration {
        Duration::from_millis(self.lease_window_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }
}
