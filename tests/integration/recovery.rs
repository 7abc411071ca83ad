//! Restart recovery integration tests.
//!
//! Each test leaves a record in a non-terminal state, as a crashed
//! process would, and starts a fresh orchestrator over the same storage.

use crate::common::{WAIT, register, scanme_success, wait_for};
use async_trait::async_trait;
use scanward::testing::ScriptedRunner;
use scanward::testing::fixtures::SCANME_XML;
use scanward::{
    AttemptOutcome, Event, EventBus, EventHandler, FailureKind, InMemoryStorage, Orchestrator,
    RetryPolicy, RunOutcome, ScanTask, Storage, TaskRecord, TaskState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventHandler for EventLog {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

impl EventLog {
    async fn resumed_states(&self) -> Vec<TaskState> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::TaskResumed { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    async fn entered(&self, state: TaskState) -> bool {
        self.events
            .lock()
            .await
            .iter()
            .any(|e| matches!(e, Event::StateChanged { to, .. } if *to == state))
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_millis(10), Duration::from_millis(40))
}

/// Insert a record that has been through `prepare`.
async fn seed(storage: &dyn Storage, prepare: impl FnOnce(&mut TaskRecord)) -> scanward::TaskId {
    let task = ScanTask::new("scanme.nmap.org", ["-sT", "--top-ports", "100"], None);
    let mut record = TaskRecord::new(task);
    prepare(&mut record);
    let id = record.id().clone();
    storage.insert_task(record).await.unwrap();
    id
}

/// Test: A task stored in PARSING is parsed without running the scanner again.
#[tokio::test]
async fn test_resume_in_parsing_does_not_rerun() {
    let storage = Arc::new(InMemoryStorage::new());
    let id = seed(storage.as_ref(), |r| {
        r.start_validation().unwrap();
        r.begin_attempt(3).unwrap();
        r.finish_attempt(AttemptOutcome::Succeeded, Some(SCANME_XML.to_string()))
            .unwrap();
    })
    .await;
    assert_eq!(storage.get_task(&id).await.unwrap().state(), TaskState::Parsing);

    let log = Arc::new(EventLog::default());
    let bus = EventBus::new();
    bus.register(log.clone()).await;
    let runner = Arc::new(ScriptedRunner::new([]));
    let (handle, task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_event_bus(bus)
        .start()
        .await;

    let record = wait_for(storage.as_ref(), &id, TaskState::Completed).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(runner.invocations(), 0);
    assert_eq!(record.attempts().len(), 1);
    assert!(record.result().unwrap().find_port(80).is_some());
    assert_eq!(log.resumed_states().await, vec![TaskState::Parsing]);
    assert!(!log.entered(TaskState::Validating).await);
    assert!(!log.entered(TaskState::Running).await);
}

/// Test: An attempt left running by a dead process is reaped as a crash and retried.
#[tokio::test]
async fn test_orphaned_attempt_reaped_after_heartbeat_timeout() {
    let storage = Arc::new(InMemoryStorage::new());
    let id = seed(storage.as_ref(), |r| {
        r.start_validation().unwrap();
        r.begin_attempt(3).unwrap();
    })
    .await;

    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_retry_policy(fast_retry())
        .with_heartbeat_timeout(Duration::from_millis(200))
        .start()
        .await;

    let record = wait_for(storage.as_ref(), &id, TaskState::Completed).await;
    handle.shutdown().await.unwrap();

    assert_eq!(runner.invocations(), 1);
    assert_eq!(record.attempts().len(), 2);
    let first = &record.attempts()[0];
    assert!(matches!(first.outcome, Some(AttemptOutcome::Crashed { .. })));
    assert!(first.finished_at.unwrap() - first.started_at >= chrono::Duration::milliseconds(200));
    assert_eq!(record.attempts()[1].number, 2);
}

/// Test: An orphaned final attempt fails the task without another run.
#[tokio::test]
async fn test_orphaned_final_attempt_fails_task() {
    let storage = Arc::new(InMemoryStorage::new());
    let id = seed(storage.as_ref(), |r| {
        r.start_validation().unwrap();
        for _ in 0..2 {
            r.begin_attempt(3).unwrap();
            r.finish_attempt(
                AttemptOutcome::TimedOut {
                    reason: "no completion within 4h".into(),
                },
                None,
            )
            .unwrap();
        }
        r.begin_attempt(3).unwrap();
    })
    .await;

    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_retry_policy(fast_retry())
        .with_heartbeat_timeout(Duration::from_millis(50))
        .start()
        .await;

    let record = wait_for(storage.as_ref(), &id, TaskState::Failed).await;
    handle.shutdown().await.unwrap();

    assert_eq!(runner.invocations(), 0);
    assert_eq!(record.attempts().len(), 3);
    assert_eq!(record.failure().unwrap().kind, FailureKind::ExecutionCrash);
}

/// Test: A task stopped between attempts continues with the next attempt.
#[tokio::test]
async fn test_resume_between_attempts_continues_numbering() {
    let storage = Arc::new(InMemoryStorage::new());
    let id = seed(storage.as_ref(), |r| {
        r.start_validation().unwrap();
        r.begin_attempt(3).unwrap();
        r.finish_attempt(
            AttemptOutcome::Crashed {
                reason: "terminated by signal 9".into(),
            },
            None,
        )
        .unwrap();
    })
    .await;

    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_retry_policy(fast_retry())
        .start()
        .await;

    let record = wait_for(storage.as_ref(), &id, TaskState::Completed).await;
    handle.shutdown().await.unwrap();

    let requests = runner.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].attempt, 2);
    assert_eq!(record.attempts().len(), 2);
}

/// Test: Queued and validating tasks are picked up on start.
#[tokio::test]
async fn test_queued_and_validating_tasks_resume() {
    let storage = Arc::new(InMemoryStorage::new());
    let queued = register(storage.as_ref(), "scanme.nmap.org", &["-sT"]).await;
    let validating = seed(storage.as_ref(), |r| r.start_validation().unwrap()).await;

    let runner = Arc::new(ScriptedRunner::new([scanme_success(), scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .start()
        .await;

    wait_for(storage.as_ref(), &queued, TaskState::Completed).await;
    wait_for(storage.as_ref(), &validating, TaskState::Completed).await;
    handle.shutdown().await.unwrap();
    assert_eq!(runner.invocations(), 2);
}

/// Test: Finished tasks are left alone on start.
#[tokio::test]
async fn test_terminal_tasks_not_resumed() {
    let storage = Arc::new(InMemoryStorage::new());
    let cancelled = seed(storage.as_ref(), |r| r.cancel().unwrap()).await;

    let orchestrator =
        Orchestrator::with_storage(Arc::clone(&storage), Arc::new(ScriptedRunner::new([])));
    assert!(orchestrator.recover().await.unwrap().is_empty());

    let (handle, _task) = orchestrator.start().await;
    assert_eq!(handle.active_count().await.unwrap(), 0);
    handle.shutdown().await.unwrap();

    let record = storage.get_task(&cancelled).await.unwrap();
    assert_eq!(record.state(), TaskState::Cancelled);
}

/// Test: A rejected task stays rejected after a restart.
#[tokio::test]
async fn test_validation_rejection_survives_restart() {
    let storage = Arc::new(InMemoryStorage::new());
    let id = register(storage.as_ref(), "10.0.0.1", &["-iL", "/etc/passwd"]).await;

    let (handle, _task) =
        Orchestrator::with_storage(Arc::clone(&storage), Arc::new(ScriptedRunner::new([])))
            .start()
            .await;
    wait_for(storage.as_ref(), &id, TaskState::Failed).await;
    handle.shutdown().await.unwrap();

    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .start()
        .await;
    handle.submit(id.clone()).await.unwrap();
    handle.shutdown().await.unwrap();

    let record = storage.get_task(&id).await.unwrap();
    assert_eq!(record.state(), TaskState::Failed);
    assert_eq!(record.failure().unwrap().kind, FailureKind::ValidationRejected);
    assert_eq!(runner.invocations(), 0);
}

/// Test: A scan interrupted by shutdown finishes after reopening the database.
#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_scan_survives_restart() {
    use scanward::SqliteStorage;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scanward.db");

    let id = {
        let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
        let runner = Arc::new(ScriptedRunner::new([]).hang_until_cancelled());
        let (handle, task) = Orchestrator::with_storage(Arc::clone(&storage), runner)
            .with_shutdown_timeout(Duration::from_millis(100))
            .start()
            .await;

        let id = register(storage.as_ref(), "scanme.nmap.org", &["-sT"]).await;
        handle.submit(id.clone()).await.unwrap();
        wait_for(storage.as_ref(), &id, TaskState::Running).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        storage.close().await;
        id
    };

    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let stored = storage.get_task(&id).await.unwrap();
    assert_eq!(stored.state(), TaskState::Running);
    assert!(stored.current_attempt().unwrap().is_in_flight());

    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_retry_policy(fast_retry())
        .with_heartbeat_timeout(Duration::from_millis(100))
        .start()
        .await;

    let record = tokio::time::timeout(WAIT, async {
        loop {
            let record = storage.get_task(&id).await.unwrap();
            if record.state().is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    handle.shutdown().await.unwrap();

    assert_eq!(record.state(), TaskState::Completed);
    assert_eq!(record.attempts().len(), 2);
    assert!(matches!(
        record.attempts()[0].outcome,
        Some(AttemptOutcome::Crashed { .. })
    ));
    assert_eq!(runner.invocations(), 1);
    assert_eq!(record.task().arguments(), ["-sT"]);
}

/// Test: A restart does not reset the attempt budget.
#[tokio::test]
async fn test_restart_preserves_attempt_budget() {
    let storage = Arc::new(InMemoryStorage::new());
    let id = seed(storage.as_ref(), |r| {
        r.start_validation().unwrap();
        r.begin_attempt(3).unwrap();
        r.finish_attempt(
            AttemptOutcome::ProcessError {
                exit_code: Some(1),
                stderr: "Failed to resolve".into(),
            },
            None,
        )
        .unwrap();
        r.begin_attempt(3).unwrap();
    })
    .await;

    let runner = Arc::new(ScriptedRunner::new([
        RunOutcome::Crash("segfault".into()),
        scanme_success(),
    ]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_retry_policy(fast_retry())
        .with_heartbeat_timeout(Duration::from_millis(50))
        .start()
        .await;

    let record = wait_for(storage.as_ref(), &id, TaskState::Failed).await;
    handle.shutdown().await.unwrap();

    // Attempt 2 is reaped, attempt 3 crashes, and the budget is spent.
    assert_eq!(runner.invocations(), 1);
    assert_eq!(record.attempts().len(), 3);
    assert_eq!(record.failure().unwrap().kind, FailureKind::ExecutionCrash);
}
