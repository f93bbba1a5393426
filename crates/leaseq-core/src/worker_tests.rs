use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;

use crate::task::OrderingRule;

/// Store fake that hands out scripted payloads and records every call.
#[derive(Default)]
struct ScriptedStore {
    pending: Mutex<VecDeque<String>>,
    next_id: AtomicU64,
    claims: AtomicUsize,
    heartbeats: AtomicUsize,
    completes: AtomicUsize,
    cancels: AtomicUsize,
    /// Heartbeat count seen by the first finalize call.
    heartbeats_at_finalize: Mutex<Option<usize>>,
    fail_claim: bool,
    fail_heartbeat: bool,
    /// Finalize calls report that the task was already finalized.
    conflict_on_finalize: bool,
    hang_claim: bool,
    hang_complete: bool,
    /// Heartbeat calls never resolve; dropping one cancels this token.
    hang_heartbeat: Option<CancellationToken>,
    /// Fired after a successful finalize so `run` returns.
    stop_after_finalize: Option<CancellationToken>,
}

impl ScriptedStore {
    fn with_tasks(payloads: &[&str]) -> Self {
        Self {
            pending: Mutex::new(payloads.iter().map(|p| p.to_string()).collect()),
            ..Default::default()
        }
    }

    fn stop_on_finalize(mut self, token: &CancellationToken) -> Self {
        self.stop_after_finalize = Some(token.clone());
        self
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.completes.load(Ordering::SeqCst),
            self.cancels.load(Ordering::SeqCst),
        )
    }

    fn finalized(&self) {
        let mut seen = self.heartbeats_at_finalize.lock().unwrap();
        if seen.is_none() {
            *seen = Some(self.heartbeats.load(Ordering::SeqCst));
        }
        drop(seen);
        if let Some(token) = &self.stop_after_finalize {
            token.cancel();
        }
    }
}

fn backend_error(operation: &'static str) -> QueueError {
    QueueError::store(operation, std::io::Error::other("connection refused"))
}

#[async_trait]
impl TaskStore for ScriptedStore {
    type Payload = String;
    type Id = u64;

    async fn init(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn create(&self, payload: String) -> Result<(), QueueError> {
        self.pending.lock().unwrap().push_back(payload);
        Ok(())
    }

    async fn claim_next(&self, rule: OrderingRule) -> Result<ClaimedTask<u64, String>, QueueError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        assert_eq!(rule, OrderingRule::OldestFirst);
        if self.hang_claim {
            std::future::pending::<()>().await;
        }
        if self.fail_claim {
            return Err(backend_error("claim_next"));
        }
        let payload = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(QueueError::NoTaskAvailable)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ClaimedTask::new(id, payload))
    }

    async fn heartbeat(&self, _id: &u64) -> Result<(), QueueError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.hang_heartbeat {
            let _guard = token.clone().drop_guard();
            std::future::pending::<()>().await;
        }
        if self.fail_heartbeat {
            return Err(backend_error("heartbeat"));
        }
        Ok(())
    }

    async fn complete(&self, id: &u64) -> Result<(), QueueError> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        if self.hang_complete {
            std::future::pending::<()>().await;
        }
        self.finalized();
        if self.conflict_on_finalize {
            return Err(QueueError::TaskConflict(id.to_string()));
        }
        Ok(())
    }

    async fn cancel(&self, id: &u64) -> Result<(), QueueError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.finalized();
        if self.conflict_on_finalize {
            return Err(QueueError::TaskConflict(id.to_string()));
        }
        Ok(())
    }
}

struct SucceedHandler;

#[async_trait]
impl TaskHandler<String> for SucceedHandler {
    async fn handle(&self, _payload: String, _cancel: CancellationToken) -> Result<(), HandlerError> {
        Ok(())
    }
}

struct CancelHandler;

#[async_trait]
impl TaskHandler<String> for CancelHandler {
    async fn handle(&self, _payload: String, _cancel: CancellationToken) -> Result<(), HandlerError> {
        Err(HandlerError::Cancel)
    }
}

struct FailHandler;

#[async_trait]
impl TaskHandler<String> for FailHandler {
    async fn handle(&self, _payload: String, _cancel: CancellationToken) -> Result<(), HandlerError> {
        Err(HandlerError::failed("boom"))
    }
}

/// Sleeps for a fixed time, or until cancelled.
struct SleepHandler {
    duration: Duration,
    saw_cancel: AtomicBool,
}

impl SleepHandler {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            saw_cancel: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskHandler<String> for SleepHandler {
    async fn handle(&self, _payload: String, cancel: CancellationToken) -> Result<(), HandlerError> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(()),
            _ = cancel.cancelled() => {
                self.saw_cancel.store(true, Ordering::SeqCst);
                Err(HandlerError::failed("interrupted"))
            }
        }
    }
}

/// Ignores the cancellation token entirely.
struct StubbornHandler;

#[async_trait]
impl TaskHandler<String> for StubbornHandler {
    async fn handle(&self, _payload: String, _cancel: CancellationToken) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

struct PanicHandler;

#[async_trait]
impl TaskHandler<String> for PanicHandler {
    async fn handle(&self, _payload: String, _cancel: CancellationToken) -> Result<(), HandlerError> {
        panic!("handler bug");
    }
}

fn config(poll_ms: u64, heartbeat_ms: u64) -> WorkerConfig {
    WorkerConfig {
        poll_interval_ms: poll_ms,
        heartbeat_interval_ms: heartbeat_ms,
        ordering: OrderingRule::OldestFirst,
        cancel_grace_ms: 100,
    }
}

#[tokio::test(start_paused = true)]
async fn test_success_completes_once() {
    let shutdown = CancellationToken::new();
    let store = Arc::new(ScriptedStore::with_tasks(&["p1"]).stop_on_finalize(&shutdown));
    let worker = Worker::new(store.clone(), config(1000, 10_000));

    worker.run(Arc::new(SucceedHandler), shutdown).await.unwrap();

    assert_eq!(store.counts(), (1, 0));
    let stats = worker.stats();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cancelled, 0);
    assert!(!stats.busy);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_request_cancels_once() {
    let shutdown = CancellationToken::new();
    let store = Arc::new(ScriptedStore::with_tasks(&["p1"]).stop_on_finalize(&shutdown));
    let worker = Worker::new(store.clone(), config(1000, 10_000));

    worker.run(Arc::new(CancelHandler), shutdown).await.unwrap();

    assert_eq!(store.counts(), (0, 1));
    assert_eq!(worker.stats().cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_handler_failure_is_fatal_without_finalize() {
    let store = Arc::new(ScriptedStore::with_tasks(&["p1", "p2"]));
    let worker = Worker::new(store.clone(), config(1000, 10_000));

    let err = worker
        .run(Arc::new(FailHandler), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Handler { ref task_id, .. } if task_id == "1"));
    assert_eq!(store.counts(), (0, 0));
    // The second task was never claimed.
    assert_eq!(store.claims.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_failure_is_fatal_and_cancels_handler() {
    let store = Arc::new(ScriptedStore {
        fail_heartbeat: true,
        ..ScriptedStore::with_tasks(&["p1"])
    });
    let worker = Worker::new(store.clone(), config(1000, 1000));
    let handler = Arc::new(SleepHandler::new(Duration::from_secs(60)));

    let err = worker
        .run(handler.clone(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Heartbeat { .. }));
    assert_eq!(err.task_id(), Some("1"));
    assert!(handler.saw_cancel.load(Ordering::SeqCst));
    assert_eq!(store.heartbeats.load(Ordering::SeqCst), 1);
    assert_eq!(store.counts(), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_heartbeats_then_completes() {
    let shutdown = CancellationToken::new();
    let store = Arc::new(ScriptedStore::with_tasks(&["p1"]).stop_on_finalize(&shutdown));
    let worker = Worker::new(store.clone(), config(1000, 1000));
    let handler = Arc::new(SleepHandler::new(Duration::from_secs(2)));

    worker.run(handler, shutdown).await.unwrap();

    let before_complete = (*store.heartbeats_at_finalize.lock().unwrap()).expect("complete was called");
    assert!(before_complete >= 1, "heartbeats before complete = {before_complete}");
    assert_eq!(store.counts(), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_lease_skips_finalize() {
    let store = Arc::new(ScriptedStore::with_tasks(&["p1"]));
    let worker = Worker::new(store.clone(), config(1000, 1000));
    let handler = Arc::new(SleepHandler::new(Duration::from_secs(60)));
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });

    worker.run(handler.clone(), shutdown).await.unwrap();

    assert!(handler.saw_cancel.load(Ordering::SeqCst));
    assert_eq!(store.counts(), (0, 0));
    assert_eq!(store.heartbeats.load(Ordering::SeqCst), 2);
    assert!(!worker.stats().busy);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_idle() {
    let store = Arc::new(ScriptedStore::default());
    let worker = Worker::new(store.clone(), config(1000, 1000));
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5500)).await;
        trigger.cancel();
    });

    worker.run(Arc::new(SucceedHandler), shutdown).await.unwrap();

    // First claim is immediate, then one per poll interval.
    let claims = store.claims.load(Ordering::SeqCst);
    assert!((5..=6).contains(&claims), "claims = {claims}");
    assert_eq!(worker.stats().claimed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_claim_error_is_fatal() {
    let store = Arc::new(ScriptedStore {
        fail_claim: true,
        ..ScriptedStore::with_tasks(&["p1"])
    });
    let worker = Worker::new(store.clone(), config(1000, 1000));

    let err = worker
        .run(Arc::new(SucceedHandler), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Claim(QueueError::Store { .. })));
    assert_eq!(err.task_id(), None);
    assert_eq!(store.claims.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_processes_queue_in_sequence() {
    let shutdown = CancellationToken::new();
    let store = Arc::new(ScriptedStore::with_tasks(&["p1", "p2", "p3"]));
    let worker = Worker::new(store.clone(), config(100, 1000));

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    worker.run(Arc::new(SucceedHandler), shutdown).await.unwrap();

    assert_eq!(store.counts(), (3, 0));
    assert_eq!(worker.stats().claimed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_stubborn_handler_is_aborted_after_grace() {
    let store = Arc::new(ScriptedStore {
        fail_heartbeat: true,
        ..ScriptedStore::with_tasks(&["p1"])
    });
    let worker = Worker::new(store.clone(), config(1000, 1000));
    let started = Instant::now();

    let err = worker
        .run(Arc::new(StubbornHandler), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Heartbeat { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_handler_panic_is_fatal() {
    let store = Arc::new(ScriptedStore::with_tasks(&["p1"]));
    let worker = Worker::new(store.clone(), config(1000, 10_000));

    let err = worker
        .run(Arc::new(PanicHandler), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Activity { .. }));
    assert_eq!(store.counts(), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_closure_handler() {
    let shutdown = CancellationToken::new();
    let store = Arc::new(ScriptedStore::with_tasks(&["p1"]).stop_on_finalize(&shutdown));
    let worker = Worker::new(store.clone(), config(1000, 10_000));

    let handler = Arc::new(|payload: String, _cancel: CancellationToken| async move {
        if payload == "p1" {
            Err::<(), HandlerError>(HandlerError::Cancel)
        } else {
            Ok(())
        }
    });

    worker.run(handler, shutdown).await.unwrap();
    assert_eq!(store.counts(), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_complete_conflict_is_surfaced() {
    let store = Arc::new(ScriptedStore {
        conflict_on_finalize: true,
        ..ScriptedStore::with_tasks(&["p1", "p2"])
    });
    let worker = Worker::new(store.clone(), config(1000, 10_000));

    let err = worker
        .run(Arc::new(SucceedHandler), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        WorkerError::Complete { ref task_id, source: QueueError::TaskConflict(_) } if task_id == "1"
    ));
    assert_eq!(store.claims.load(Ordering::SeqCst), 1);
    assert_eq!(worker.stats().completed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_conflict_is_surfaced() {
    let store = Arc::new(ScriptedStore {
        conflict_on_finalize: true,
        ..ScriptedStore::with_tasks(&["p1", "p2"])
    });
    let worker = Worker::new(store.clone(), config(1000, 10_000));

    let err = worker
        .run(Arc::new(CancelHandler), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        WorkerError::Cancel { ref task_id, source: QueueError::TaskConflict(_) } if task_id == "1"
    ));
    assert_eq!(store.claims.load(Ordering::SeqCst), 1);
    assert_eq!(worker.stats().cancelled, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_blocked_claim() {
    let store = Arc::new(ScriptedStore {
        hang_claim: true,
        ..ScriptedStore::with_tasks(&["p1"])
    });
    let worker = Worker::new(store.clone(), config(1000, 1000));
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(60),
        worker.run(Arc::new(SucceedHandler), shutdown),
    )
    .await;

    assert!(matches!(result, Ok(Ok(()))), "run did not stop while claim_next was blocked");
    assert_eq!(store.claims.load(Ordering::SeqCst), 1);
    assert_eq!(worker.stats().claimed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_blocked_complete() {
    let store = Arc::new(ScriptedStore {
        hang_complete: true,
        ..ScriptedStore::with_tasks(&["p1"])
    });
    let worker = Worker::new(store.clone(), config(1000, 10_000));
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(60),
        worker.run(Arc::new(SucceedHandler), shutdown),
    )
    .await;

    assert!(matches!(result, Ok(Ok(()))), "run did not stop while complete was blocked");
    assert_eq!(store.completes.load(Ordering::SeqCst), 1);
    let stats = worker.stats();
    assert_eq!(stats.completed, 0);
    assert!(!stats.busy);
}

#[tokio::test(start_paused = true)]
async fn test_handler_result_survives_shutdown_during_drain() {
    let shutdown = CancellationToken::new();
    // The blocked heartbeat is dropped while the lease unwinds, which fires
    // shutdown after the handler has already succeeded.
    let store = Arc::new(ScriptedStore {
        hang_heartbeat: Some(shutdown.clone()),
        ..ScriptedStore::with_tasks(&["p1"])
    });
    let worker = Worker::new(store.clone(), config(1000, 1000));
    let handler = Arc::new(SleepHandler::new(Duration::from_secs(2)));

    worker.run(handler, shutdown.clone()).await.unwrap();

    assert!(shutdown.is_cancelled());
    assert_eq!(store.heartbeats.load(Ordering::SeqCst), 1);
    assert_eq!(store.counts(), (1, 0));
    assert_eq!(worker.stats().completed, 1);
}
