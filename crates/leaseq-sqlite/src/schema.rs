//! Database schema management.

use rusqlite::Connection;

/// Create the task table and its indexes if they are missing.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Timestamps are milliseconds since the Unix epoch.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leaseq_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER,
    cancelled_at INTEGER,
    leased_at INTEGER,
    payload TEXT NOT NULL CHECK (json_valid(payload))
);

-- Open tasks in claim order
CREATE INDEX IF NOT EXISTS idx_leaseq_tasks_open
    ON leaseq_tasks(created_at, id)
    WHERE completed_at IS NULL AND cancelled_at IS NULL;
"#;
