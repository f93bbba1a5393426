//! CLI definitions for leaseq.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// leaseq CLI.
#[derive(Parser)]
#[command(name = "leaseq")]
#[command(about = "Lease-based task queue")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LEASEQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding `store.path`
    #[arg(long, env = "LEASEQ_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Create the task table if it does not exist
    Init,

    /// Add a task to the queue
    Enqueue {
        /// Task payload as JSON, e.g. '{"command": ["echo", "hello"]}'
        payload: String,
    },

    /// Claim and run tasks until interrupted
    Work,
}
