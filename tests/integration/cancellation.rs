//! Cancellation integration tests.
//!
//! A cancelled task must end `CANCELLED` whatever stage it was in, and
//! nothing the scanner reports afterwards may change that.

use crate::common::{WAIT, register, scanme_success, wait_for};
use scanward::testing::ScriptedRunner;
use scanward::testing::fixtures::SCANME_XML;
use scanward::{
    DispatchError, Dispatcher, InMemoryStorage, Orchestrator, OrchestratorError, Registry,
    RegistryError, RetryPolicy, RunOutcome, ScanTask, Storage, TaskId, TaskRecord, TaskState,
};
use std::sync::Arc;
use std::time::Duration;

/// Give a stopped instance time to commit anything it still could.
const SETTLE: Duration = Duration::from_millis(150);

async fn wait_for_invocations(runner: &ScriptedRunner, count: u32) {
    tokio::time::timeout(WAIT, async {
        while runner.invocations() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("runner was not invoked {} time(s)", count));
}

/// Test: Cancelling a running scan wins over a success reported afterwards.
#[tokio::test]
async fn test_cancel_running_discards_late_success() {
    let storage = Arc::new(InMemoryStorage::new());
    let runner = Arc::new(ScriptedRunner::new([]).late_success(SCANME_XML));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .start()
        .await;
    let dispatcher = Dispatcher::new(Registry::new(Arc::clone(&storage)), handle.clone());

    let id = dispatcher
        .start("scanme.nmap.org", vec!["-sT".into()], None)
        .await
        .unwrap();
    wait_for(storage.as_ref(), &id, TaskState::Running).await;
    wait_for_invocations(&runner, 1).await;

    assert_eq!(dispatcher.cancel(&id).await.unwrap(), TaskState::Cancelled);
    tokio::time::sleep(SETTLE).await;

    let record = storage.get_task(&id).await.unwrap();
    assert_eq!(record.state(), TaskState::Cancelled);
    assert!(record.result().is_none());
    assert!(record.cancel_requested());
    assert!(record.attempts()[0].outcome.is_none());

    let err = dispatcher.fetch(&id).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Registry(RegistryError::NotAvailable {
            state: TaskState::Cancelled,
            ..
        })
    ));
    handle.shutdown().await.unwrap();
}

/// Test: A task waiting for capacity is cancelled without ever running.
#[tokio::test]
async fn test_cancel_queued_task_never_runs() {
    let storage = Arc::new(InMemoryStorage::new());
    let runner = Arc::new(ScriptedRunner::new([]).hang_until_cancelled());
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_max_workers(1)
        .start()
        .await;

    let busy = register(storage.as_ref(), "10.0.0.1", &["-sT"]).await;
    handle.submit(busy.clone()).await.unwrap();
    wait_for(storage.as_ref(), &busy, TaskState::Running).await;

    let waiting = register(storage.as_ref(), "10.0.0.2", &["-sT"]).await;
    handle.submit(waiting.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        storage.get_task(&waiting).await.unwrap().state(),
        TaskState::Queued
    );

    assert_eq!(handle.cancel(waiting.clone()).await.unwrap(), TaskState::Cancelled);
    assert_eq!(handle.cancel(busy.clone()).await.unwrap(), TaskState::Cancelled);
    tokio::time::sleep(SETTLE).await;

    assert_eq!(runner.invocations(), 1);
    let record = storage.get_task(&waiting).await.unwrap();
    assert_eq!(record.state(), TaskState::Cancelled);
    assert!(record.attempts().is_empty());
    handle.shutdown().await.unwrap();
}

/// Test: A task with no live instance is cancelled straight in storage.
#[tokio::test]
async fn test_cancel_validating_task_without_instance() {
    let storage = Arc::new(InMemoryStorage::new());
    let (handle, _task) =
        Orchestrator::with_storage(Arc::clone(&storage), Arc::new(ScriptedRunner::new([])))
            .start()
            .await;

    let mut record = TaskRecord::new(ScanTask::new("10.0.0.1", ["-sT"], None));
    record.start_validation().unwrap();
    let id = record.id().clone();
    storage.insert_task(record).await.unwrap();

    assert_eq!(handle.cancel(id.clone()).await.unwrap(), TaskState::Cancelled);
    assert_eq!(
        storage.get_task(&id).await.unwrap().state(),
        TaskState::Cancelled
    );
    handle.shutdown().await.unwrap();
}

/// Test: Cancelling during the retry backoff stops further attempts.
#[tokio::test]
async fn test_cancel_during_backoff_stops_retries() {
    let storage = Arc::new(InMemoryStorage::new());
    let runner = Arc::new(ScriptedRunner::new([
        RunOutcome::Crash("terminated by signal 9".into()),
        scanme_success(),
    ]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .with_retry_policy(RetryPolicy::exponential(
            3,
            Duration::from_secs(30),
            Duration::from_secs(60),
        ))
        .start()
        .await;

    let id = register(storage.as_ref(), "10.0.0.1", &["-sT"]).await;
    handle.submit(id.clone()).await.unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            let record = storage.get_task(&id).await.unwrap();
            if record.attempts().first().is_some_and(|a| a.outcome.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(handle.cancel(id.clone()).await.unwrap(), TaskState::Cancelled);
    tokio::time::sleep(SETTLE).await;

    let record = storage.get_task(&id).await.unwrap();
    assert_eq!(record.state(), TaskState::Cancelled);
    assert_eq!(record.attempts().len(), 1);
    assert_eq!(runner.invocations(), 1);
    handle.shutdown().await.unwrap();
}

/// Test: Cancelling a finished scan reports its final state and changes nothing.
#[tokio::test]
async fn test_cancel_completed_is_noop() {
    let storage = Arc::new(InMemoryStorage::new());
    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner)
        .start()
        .await;

    let id = register(storage.as_ref(), "scanme.nmap.org", &["-sT"]).await;
    handle.submit(id.clone()).await.unwrap();
    let before = wait_for(storage.as_ref(), &id, TaskState::Completed).await;

    assert_eq!(handle.cancel(id.clone()).await.unwrap(), TaskState::Completed);

    let after = storage.get_task(&id).await.unwrap();
    assert_eq!(after.state(), TaskState::Completed);
    assert_eq!(after.version(), before.version());
    assert!(after.result().is_some());
    assert!(!after.cancel_requested());
    handle.shutdown().await.unwrap();
}

/// Test: A second cancel reports CANCELLED again.
#[tokio::test]
async fn test_cancel_twice() {
    let storage = Arc::new(InMemoryStorage::new());
    let runner = Arc::new(ScriptedRunner::new([]).hang_until_cancelled());
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner)
        .start()
        .await;

    let id = register(storage.as_ref(), "10.0.0.1", &["-sT"]).await;
    handle.submit(id.clone()).await.unwrap();
    wait_for(storage.as_ref(), &id, TaskState::Running).await;

    assert_eq!(handle.cancel(id.clone()).await.unwrap(), TaskState::Cancelled);
    assert_eq!(handle.cancel(id.clone()).await.unwrap(), TaskState::Cancelled);
    handle.shutdown().await.unwrap();
}

/// Test: Cancelling an unknown id is an error.
#[tokio::test]
async fn test_cancel_unknown_task() {
    let storage = Arc::new(InMemoryStorage::new());
    let (handle, _task) = Orchestrator::with_storage(storage, Arc::new(ScriptedRunner::new([])))
        .start()
        .await;

    let err = handle.cancel(TaskId::new("scan-missing")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TaskNotFound(_)));
    handle.shutdown().await.unwrap();
}

/// Test: A cancelled task is not picked up again after a restart.
#[tokio::test]
async fn test_cancelled_task_stays_cancelled_after_restart() {
    let storage = Arc::new(InMemoryStorage::new());
    let runner = Arc::new(ScriptedRunner::new([]).hang_until_cancelled());
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner)
        .start()
        .await;

    let id = register(storage.as_ref(), "10.0.0.1", &["-sT"]).await;
    handle.submit(id.clone()).await.unwrap();
    wait_for(storage.as_ref(), &id, TaskState::Running).await;
    handle.cancel(id.clone()).await.unwrap();
    handle.shutdown().await.unwrap();

    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner.clone())
        .start()
        .await;
    tokio::time::sleep(SETTLE).await;
    handle.shutdown().await.unwrap();

    assert_eq!(runner.invocations(), 0);
    assert_eq!(
        storage.get_task(&id).await.unwrap().state(),
        TaskState::Cancelled
    );
}
