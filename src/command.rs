//! Task payload and handler used by the `work` command.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use leaseq_core::{HandlerError, TaskHandler};

/// A program invocation stored as the task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommandTask {
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

impl CommandTask {
    pub(crate) fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }
}

/// Runs the task's command as a child process.
///
/// Exit status 0 completes the task and any other status cancels it. A
/// command that cannot be spawned is a handler failure.
pub(crate) struct CommandHandler;

#[async_trait]
impl TaskHandler<CommandTask> for CommandHandler {
    async fn handle(&self, task: CommandTask, cancel: CancellationToken) -> Result<(), HandlerError> {
        let Some((program, args)) = task.command.split_first() else {
            warn!("Task has an empty command, cancelling");
            return Err(HandlerError::Cancel);
        };

        let mut child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .map_err(HandlerError::failed)?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(HandlerError::failed)?;
                if status.success() {
                    info!(program = %program, "Command succeeded");
                    Ok(())
                } else {
                    warn!(program = %program, %status, "Command failed, cancelling task");
                    Err(HandlerError::Cancel)
                }
            }
            _ = cancel.cancelled() => {
                child.kill().await.map_err(HandlerError::failed)?;
                Err(HandlerError::failed(format!("{} interrupted", program)))
            }
        }
    }
}
