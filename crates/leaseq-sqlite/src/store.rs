//! SQLite task store.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_rusqlite::Connection;
use tracing::debug;

use leaseq_core::{ClaimedTask, Clock, OrderingRule, QueueError, SystemClock, TaskRecord, TaskStore};

use crate::config::SqliteStoreConfig;
use crate::schema::init_schema;

const CLAIM_OLDEST_FIRST: &str = "
    UPDATE leaseq_tasks SET leased_at = ?1
    WHERE id = (
        SELECT id FROM leaseq_tasks
        WHERE completed_at IS NULL
          AND cancelled_at IS NULL
          AND (leased_at IS NULL OR ?1 - leased_at > ?2)
        ORDER BY created_at ASC, id ASC
        LIMIT 1
    )
    RETURNING id, payload";

const COMPLETE: &str = "
    UPDATE leaseq_tasks SET completed_at = ?1
    WHERE id = ?2 AND completed_at IS NULL AND cancelled_at IS NULL";

const CANCEL: &str = "
    UPDATE leaseq_tasks SET cancelled_at = ?1
    WHERE id = ?2 AND completed_at IS NULL AND cancelled_at IS NULL";

enum Finalized {
    Done,
    Conflict,
    Missing,
}

/// Task store backed by a SQLite database.
///
/// Payloads are stored as JSON text. Every claim and finalize runs in an
/// `IMMEDIATE` transaction, so the database write lock serializes competing
/// workers across connections and processes.
pub struct SqliteTaskStore<T> {
    pool: Vec<Connection>,
    next: AtomicUsize,
    lease_window: Duration,
    clock: Arc<dyn Clock>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> SqliteTaskStore<T> {
    /// Open the store described by `config`.
    ///
    /// A file database gets `max_connections` connections in WAL mode. An
    /// in-memory database is private to its connection, so it always gets one.
    pub async fn open(config: &SqliteStoreConfig) -> Result<Self, QueueError> {
        let Some(path) = &config.path else {
            return Self::open_in_memory(config.lease_window()).await;
        };

        let size = config.max_connections.max(1);
        let busy_timeout = config.busy_timeout();
        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open(path.clone())
                .await
                .map_err(|e| QueueError::store("open", e))?;
            conn.call(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                Ok(())
            })
            .await
            .map_err(|e| QueueError::store("open", e))?;
            pool.push(conn);
        }

        debug!(path = %path.display(), connections = size, "Opened SQLite task store");
        Ok(Self::from_pool(pool, config.lease_window()))
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory(lease_window: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| QueueError::store("open", e))?;
        Ok(Self::from_pool(vec![conn], lease_window))
    }

    fn from_pool(pool: Vec<Connection>, lease_window: Duration) -> Self {
        Self {
            pool,
            next: AtomicUsize::new(0),
            lease_window,
            clock: Arc::new(SystemClock),
            _payload: PhantomData,
        }
    }

    /// Replace the time source used to stamp and expire leases.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn lease_window(&self) -> Duration {
        self.lease_window
    }

    pub fn connections(&self) -> usize {
        self.pool.len()
    }

    fn conn(&self) -> &Connection {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        &self.pool[index]
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.lease_window.as_millis()).unwrap_or(i64::MAX)
    }

    async fn finalize(&self, id: i64, sql: &'static str, operation: &'static str) -> Result<(), QueueError> {
        let now = self.now_ms();
        let outcome = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(sql, params![now, id])?;
                let outcome = if changed > 0 {
                    Finalized::Done
                } else {
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM leaseq_tasks WHERE id = ?1)",
                        [id],
                        |row| row.get(0),
                    )?;
                    if exists { Finalized::Conflict } else { Finalized::Missing }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(|e| QueueError::store(operation, e))?;

        match outcome {
            Finalized::Done => {
                debug!(task_id = id, operation, "Finalized task");
                Ok(())
            }
            Finalized::Conflict => Err(QueueError::TaskConflict(id.to_string())),
            Finalized::Missing => Err(QueueError::TaskNotFound(id.to_string())),
        }
    }
}

impl<T> SqliteTaskStore<T>
where
    T: DeserializeOwned,
{
    /// Read a task record.
    pub async fn get(&self, id: i64) -> Result<Option<TaskRecord<T>>, QueueError> {
        let row = self
            .conn()
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT payload, created_at, leased_at, completed_at, cancelled_at
                         FROM leaseq_tasks WHERE id = ?1",
                        [id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, Option<i64>>(2)?,
                                row.get::<_, Option<i64>>(3)?,
                                row.get::<_, Option<i64>>(4)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|e| QueueError::store("get", e))?;

        let Some((payload, created_at, leased_at, completed_at, cancelled_at)) = row else {
            return Ok(None);
        };

        Ok(Some(TaskRecord {
            payload: serde_json::from_str(&payload)?,
            created_at: ms_to_dt(created_at),
            leased_at: leased_at.map(ms_to_dt),
            completed_at: completed_at.map(ms_to_dt),
            cancelled_at: cancelled_at.map(ms_to_dt),
        }))
    }
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl<T> TaskStore for SqliteTaskStore<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Payload = T;
    type Id = i64;

    async fn init(&self) -> Result<(), QueueError> {
        self.conn()
            .call(|conn| Ok(init_schema(conn)?))
            .await
            .map_err(|e| QueueError::store("init", e))
    }

    async fn create(&self, payload: T) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&payload)?;
        let now = self.now_ms();
        let id = self
            .conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO leaseq_tasks (created_at, payload) VALUES (?1, ?2)",
                    params![now, payload],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(|e| QueueError::store("create", e))?;

        debug!(task_id = id, "Created task");
        Ok(())
    }

    async fn claim_next(&self, rule: OrderingRule) -> Result<ClaimedTask<i64, T>, QueueError> {
        let sql = match rule {
            OrderingRule::OldestFirst => CLAIM_OLDEST_FIRST,
            OrderingRule::Unspecified => return Err(QueueError::UnsupportedRule(rule)),
        };

        let now = self.now_ms();
        let window = self.window_ms();
        let claimed = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let row = tx
                    .query_row(sql, params![now, window], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })
                    .optional()?;
                tx.commit()?;
                Ok(row)
            })
            .await
            .map_err(|e| QueueError::store("claim_next", e))?;

        let (id, payload) = claimed.ok_or(QueueError::NoTaskAvailable)?;
        debug!(task_id = id, %rule, "Claimed task");
        Ok(ClaimedTask::new(id, serde_json::from_str(&payload)?))
    }

    async fn heartbeat(&self, id: &i64) -> Result<(), QueueError> {
        let id = *id;
        let now = self.now_ms();
        let changed = self
            .conn()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE leaseq_tasks SET leased_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?)
            })
            .await
            .map_err(|e| QueueError::store("heartbeat", e))?;

        if changed == 0 {
            return Err(QueueError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn complete(&self, id: &i64) -> Result<(), QueueError> {
        self.finalize(*id, COMPLETE, "complete").await
    }

    async fn cancel(&self, id: &i64) -> Result<(), QueueError> {
        self.finalize(*id, CANCEL, "cancel").await
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
