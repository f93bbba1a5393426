//! `work` command: a supervised worker running queued commands.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use leaseq_config::Config;
use leaseq_core::{TaskStore, Worker, WorkerStats};

use crate::command::{CommandHandler, CommandTask};

pub(crate) async fn work<S>(config: &Config, store: S) -> Result<(), Box<dyn std::error::Error>>
where
    S: TaskStore<Payload = CommandTask> + 'static,
{
    store.init().await?;

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let stats = run_supervised(config, Arc::new(store), shutdown).await;
    info!(
        claimed = stats.claimed,
        completed = stats.completed,
        cancelled = stats.cancelled,
        "Worker exited"
    );
    Ok(())
}

/// Run a worker until `shutdown`, restarting it after fatal errors.
pub(crate) async fn run_supervised<S>(
    config: &Config,
    store: Arc<S>,
    shutdown: CancellationToken,
) -> WorkerStats
where
    S: TaskStore<Payload = CommandTask> + 'static,
{
    let worker = Worker::new(store, config.worker.clone());
    let handler = Arc::new(CommandHandler);

    supervise(config.supervisor.restart_delay(), &shutdown, || {
        worker.run(handler.clone(), shutdown.clone())
    })
    .await;

    worker.stats()
}

/// Call `run` until it returns `Ok` or `shutdown` fires, pausing
/// `restart_delay` after each error. Returns the number of restarts.
pub(crate) async fn supervise<F, Fut, E>(
    restart_delay: Duration,
    shutdown: &CancellationToken,
    mut run: F,
) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut restarts = 0;
    loop {
        match run().await {
            Ok(()) => return restarts,
            Err(e) => {
                error!(error = %e, restarts, "Worker failed");
                tokio::select! {
                    _ = shutdown.cancelled() => return restarts,
                    _ = tokio::time::sleep(restart_delay) => {}
                }
                restarts += 1;
                warn!(
                    delay_ms = restart_delay.as_millis() as u64,
                    restarts, "Restarting worker"
                );
            }
        }
    }
}

fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, stopping worker");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
#[path = "cmd_work_tests.rs"]
mod tests;
