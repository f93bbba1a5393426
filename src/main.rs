//! leaseq - lease-based task queue.
//!
//! Main entry point for the leaseq CLI.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use leaseq_config::{Config, ConfigError, ConfigLoader, LogFormat, LoggingConfig};
use leaseq_sqlite::SqliteTaskStore;

mod cli;
mod cmd_queue;
mod cmd_work;
mod command;

use cli::{Cli, Commands};
use command::CommandTask;

/// Looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "leaseq.toml";

const DEFAULT_DB_PATH: &str = "~/.leaseq/tasks.db";

/// Initialize tracing with console and optional file output.
fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let console = match logging.format()? {
        LogFormat::Text => fmt::layer().with_target(true).with_ansi(true).boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    let file = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("leaseq")
                .filename_suffix("log")
                .max_log_files(30)
                .build(dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // The guard flushes buffered lines on drop and must live until exit.
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();

    Ok(())
}

/// Read the config file, falling back to defaults when none exists.
fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            ConfigLoader::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => Config::default(),
    };

    if let Some(db) = &cli.db {
        config.store.path = Some(db.clone());
    }
    // Separate CLI invocations only share a queue through a file.
    if config.store.path.is_none() {
        config.store.path = Some(PathBuf::from(ConfigLoader::expand_path(DEFAULT_DB_PATH)));
    }

    Ok(config)
}

async fn open_store(config: &Config) -> Result<SqliteTaskStore<CommandTask>, Box<dyn std::error::Error>> {
    if let Some(parent) = config.store.path.as_deref().and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(SqliteTaskStore::open(&config.store).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    init_tracing(&config.logging)?;
    let config = ConfigLoader::check(config)?;

    if let Some(path) = &config.store.path {
        info!(db = %path.display(), "Using task database");
    }

    let store = open_store(&config).await?;

    match cli.command {
        Commands::Init => cmd_queue::init(&store).await,
        Commands::Enqueue { payload } => cmd_queue::enqueue(&store, &payload).await,
        Commands::Work => cmd_work::work(&config, store).await,
    }
}
