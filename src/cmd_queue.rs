//! `init` and `enqueue` commands.

use leaseq_core::TaskStore;
use leaseq_sqlite::SqliteTaskStore;
use tracing::info;

use crate::command::CommandTask;

pub(crate) async fn init(store: &SqliteTaskStore<CommandTask>) -> Result<(), Box<dyn std::error::Error>> {
    store.init().await?;
    info!("Task table ready");
    println!("Task table ready");
    Ok(())
}

pub(crate) async fn enqueue(
    store: &SqliteTaskStore<CommandTask>,
    payload: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let task: CommandTask = serde_json::from_str(payload)
        .map_err(|e| format!("Invalid task payload: {}", e))?;
    let Some(program) = task.program().map(str::to_string) else {
        return Err("Task command must not be empty".into());
    };

    store.init().await?;
    store.create(task).await?;

    info!(program = %program, "Task enqueued");
    println!("Enqueued {}", program);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaseq_core::OrderingRule;
    use std::time::Duration;

    async fn store() -> SqliteTaskStore<CommandTask> {
        SqliteTaskStore::open_in_memory(Duration::from_secs(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_valid_payload() {
        let store = store().await;
        enqueue(&store, r#"{"command": ["echo", "hello"]}"#)
            .await
            .unwrap();

        let claimed = store.claim_next(OrderingRule::OldestFirst).await.unwrap();
        assert_eq!(claimed.payload.command, vec!["echo", "hello"]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_json() {
        let store = store().await;
        let err = enqueue(&store, "{not json").await.unwrap_err();
        assert!(err.to_string().contains("Invalid task payload"));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_command() {
        let store = store().await;
        assert!(enqueue(&store, r#"{"command": []}"#).await.is_err());

        init(&store).await.unwrap();
        assert!(matches!(
            store.claim_next(OrderingRule::OldestFirst).await,
            Err(leaseq_core::QueueError::NoTaskAvailable)
        ));
    }
}
