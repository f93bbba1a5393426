//! # leaseq core
//!
//! Lease-based task queue primitives.
//!
//! ## Features
//!
//! - Storage-agnostic [`TaskStore`] contract with atomic claim and
//!   finalize-once semantics
//! - In-process [`MemoryTaskStore`]
//! - [`Worker`] engine racing a heartbeat loop against the handler under a
//!   shared cancellation scope
//! - Pluggable [`OrderingRule`]

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod store;
pub mod task;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WorkerConfig;
pub use error::{BoxError, QueueError};
pub use handler::{HandlerError, TaskHandler};
pub use store::{MemoryTaskStore, TaskStore};
pub use task::{ClaimedTask, OrderingRule, TaskRecord};
pub use worker::{Worker, WorkerError, WorkerStats};

pub use tokio_util::sync::CancellationToken;
