//! Execution of the external scan command.
//!
//! A [`ScanRunner`] runs one attempt of a scan and reports how it ended.
//! It emits [`Heartbeat`]s while the attempt is alive and stops as soon
//! as its cancellation token fires. [`CommandRunner`] is the production
//! implementation that spawns `nmap`.

mod command;

pub use command::{CommandRunner, CommandRunnerBuilder};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::attempt::AttemptOutcome;
use crate::core::types::TaskId;

/// What to run for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub task_id: TaskId,
    pub attempt: u32,
    pub target: String,
    /// Validated arguments, passed verbatim.
    pub arguments: Vec<String>,
}

/// Periodic liveness signal from a running attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// How a single run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit status 0.
    Success { stdout: String, stderr: String },
    /// The run exceeded its ceiling and was killed.
    Timeout(Duration),
    /// Non-zero exit status.
    ProcessError {
        exit_code: Option<i32>,
        stderr: String,
    },
    /// Spawn failure or abnormal termination.
    Crash(String),
    /// Stopped because the cancellation token fired.
    Cancelled,
}

impl RunOutcome {
    /// The attempt outcome to record, with output for successful runs.
    ///
    /// `None` for a cancelled run, which records nothing.
    pub fn into_attempt_outcome(self) -> Option<(AttemptOutcome, Option<String>)> {
        match self {
            RunOutcome::Success { stdout, .. } => Some((AttemptOutcome::Succeeded, Some(stdout))),
            RunOutcome::Timeout(ceiling) => Some((
                AttemptOutcome::TimedOut {
                    reason: format!("no completion within {:?}", ceiling),
                },
                None,
            )),
            RunOutcome::ProcessError { exit_code, stderr } => {
                Some((AttemptOutcome::ProcessError { exit_code, stderr }, None))
            }
            RunOutcome::Crash(reason) => Some((AttemptOutcome::Crashed { reason }, None)),
            RunOutcome::Cancelled => None,
        }
    }
}

/// Runs one attempt of a scan.
#[async_trait]
pub trait ScanRunner: Send + Sync {
    /// Run the command for `request`.
    ///
    /// Implementations send heartbeats on `heartbeats` while the work is
    /// alive and return [`RunOutcome::Cancelled`] promptly once `cancel`
    /// fires.
    async fn run(
        &self,
        request: &RunRequest,
        heartbeats: mpsc::Sender<Heartbeat>,
        cancel: CancellationToken,
    ) -> RunOutcome;
}
