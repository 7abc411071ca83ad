//! Testing utilities for users of the scanward library.
//!
//! This module provides helpers for testing scan orchestration without
//! a real scanner:
//!
//! - [`ScriptedRunner`]: A [`ScanRunner`] that replays scripted outcomes
//! - [`fixtures`]: Captured nmap XML output
//! - [`wait_for_state`]: Polls storage until a task reaches a state

pub mod fixtures;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::state::TaskState;
use crate::core::types::TaskId;
use crate::execution::{Heartbeat, RunOutcome, RunRequest, ScanRunner};
use crate::storage::{Storage, TaskRecord};

/// What a [`ScriptedRunner`] does once its script is used up.
#[derive(Debug, Clone)]
enum Fallback {
    /// Report a crash.
    Crash,
    /// Run until cancelled.
    Hang,
    /// Run until cancelled, then report success anyway.
    LateSuccess(String),
}

/// A runner that replays scripted outcomes, one per invocation.
///
/// Useful for driving the orchestrator through retries, timeouts and
/// cancellation deterministically.
///
/// # Example
///
/// ```
/// use scanward::RunOutcome;
/// use scanward::testing::{ScriptedRunner, fixtures::SCANME_XML};
///
/// // Crashes once, then returns the captured scan.
/// let runner = ScriptedRunner::new([
///     RunOutcome::Crash("killed".into()),
///     RunOutcome::Success { stdout: SCANME_XML.to_string(), stderr: String::new() },
/// ]);
/// assert_eq!(runner.invocations(), 0);
/// ```
pub struct ScriptedRunner {
    outcomes: Mutex<VecDeque<RunOutcome>>,
    fallback: Fallback,
    delay: Duration,
    heartbeat_interval: Option<Duration>,
    invocations: AtomicU32,
    requests: Mutex<Vec<RunRequest>>,
}

impl ScriptedRunner {
    /// Create a runner that returns `outcomes` in order, then crashes.
    pub fn new(outcomes: impl IntoIterator<Item = RunOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            fallback: Fallback::Crash,
            delay: Duration::ZERO,
            heartbeat_interval: None,
            invocations: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Once the script is used up, run until cancelled.
    pub fn hang_until_cancelled(mut self) -> Self {
        self.fallback = Fallback::Hang;
        self
    }

    /// Once the script is used up, run until cancelled and then report
    /// success with `stdout` regardless.
    pub fn late_success(mut self, stdout: impl Into<String>) -> Self {
        self.fallback = Fallback::LateSuccess(stdout.into());
        self
    }

    /// Take `delay` before returning each scripted outcome.
    ///
    /// Cancellation during the delay ends the run as cancelled.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Send heartbeats every `interval` while a run is in progress.
    pub fn with_heartbeats(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Number of times `run` has been called.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Every request received so far, in call order.
    pub async fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().await.clone()
    }

    async fn beat_until(
        &self,
        attempt: u32,
        heartbeats: &mpsc::Sender<Heartbeat>,
        done: impl std::future::Future<Output = ()>,
    ) {
        tokio::pin!(done);
        let Some(interval) = self.heartbeat_interval else {
            done.await;
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = &mut done => return,
                _ = ticker.tick() => {
                    let _ = heartbeats
                        .send(Heartbeat { attempt, at: chrono::Utc::now() })
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl ScanRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &RunRequest,
        heartbeats: mpsc::Sender<Heartbeat>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        let scripted = self.outcomes.lock().await.pop_front();
        match scripted {
            Some(outcome) => {
                let mut cancelled = false;
                self.beat_until(request.attempt, &heartbeats, async {
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = cancel.cancelled() => cancelled = true,
                    }
                })
                .await;
                if cancelled { RunOutcome::Cancelled } else { outcome }
            }
            None => {
                if let Fallback::Crash = self.fallback {
                    return RunOutcome::Crash("no scripted outcome left".to_string());
                }
                self.beat_until(request.attempt, &heartbeats, cancel.cancelled())
                    .await;
                match &self.fallback {
                    Fallback::LateSuccess(stdout) => RunOutcome::Success {
                        stdout: stdout.clone(),
                        stderr: String::new(),
                    },
                    _ => RunOutcome::Cancelled,
                }
            }
        }
    }
}

/// Wait for a task to reach `expected`, polling storage every 10ms.
///
/// This is more reliable than fixed sleeps since execution time can vary.
/// Returns the record once it is in `expected`, or an error describing
/// the last seen state after `timeout`.
pub async fn wait_for_state(
    storage: &dyn Storage,
    task_id: &TaskId,
    expected: TaskState,
    timeout: Duration,
) -> Result<TaskRecord, String> {
    let start = tokio::time::Instant::now();
    loop {
        let current = match storage.get_task(task_id).await {
            Ok(record) if record.state() == expected => return Ok(record),
            Ok(record) => record.state().to_string(),
            Err(e) => e.to_string(),
        };
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout waiting for task {} to reach {}, last seen: {}",
                task_id, expected, current
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
