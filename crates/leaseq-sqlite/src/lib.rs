//! SQLite task store for leaseq.
//!
//! Persists tasks in a single `leaseq_tasks` table and implements
//! [`leaseq_core::TaskStore`] with one atomic statement per claim and finalize.

mod config;
mod schema;
mod store;

pub use config::SqliteStoreConfig;
pub use schema::init_schema;
pub use store::SqliteTaskStore;
