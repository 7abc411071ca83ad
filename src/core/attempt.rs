//! Execution attempts and terminal failure reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Heartbeats kept per attempt; older ones are dropped.
pub const MAX_RECORDED_HEARTBEATS: usize = 32;

/// How an execution attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The command exited cleanly; output is stored on the attempt.
    Succeeded,
    /// No completion (or no heartbeat) within the allowed time.
    TimedOut { reason: String },
    /// The process could not be started, died by signal, or its worker was lost.
    Crashed { reason: String },
    /// The command exited with a non-zero status.
    ProcessError {
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded)
    }

    /// Failure kind reported if this outcome exhausts the attempt budget.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            AttemptOutcome::Succeeded => None,
            AttemptOutcome::TimedOut { .. } => Some(FailureKind::ExecutionTimeout),
            AttemptOutcome::Crashed { .. } => Some(FailureKind::ExecutionCrash),
            AttemptOutcome::ProcessError { .. } => Some(FailureKind::ProcessError),
        }
    }

    /// Build the terminal failure for this outcome on attempt number `attempt`.
    pub fn to_failure(&self, attempt: u32) -> Option<Failure> {
        let kind = self.failure_kind()?;
        let failure = match self {
            AttemptOutcome::Succeeded => return None,
            AttemptOutcome::TimedOut { reason } => {
                Failure::new(kind, format!("attempt {} timed out: {}", attempt, reason))
            }
            AttemptOutcome::Crashed { reason } => {
                Failure::new(kind, format!("attempt {} crashed: {}", attempt, reason))
            }
            AttemptOutcome::ProcessError { exit_code, stderr } => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Failure::new(
                    kind,
                    format!("attempt {} exited with code {}", attempt, code),
                )
                .with_diagnostics(stderr.clone())
            }
        };
        Some(failure)
    }
}

/// One try of a task's running stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// 1-indexed attempt number.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    /// Most recent heartbeats, oldest first.
    pub heartbeats: Vec<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the attempt is in flight.
    pub outcome: Option<AttemptOutcome>,
    /// Raw command output, only present on success.
    pub output: Option<String>,
}

impl ExecutionAttempt {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            started_at: Utc::now(),
            heartbeats: Vec::new(),
            finished_at: None,
            outcome: None,
            output: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.outcome.is_none()
    }

    /// Record a heartbeat, keeping only the most recent ones.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        self.heartbeats.push(at);
        if self.heartbeats.len() > MAX_RECORDED_HEARTBEATS {
            let excess = self.heartbeats.len() - MAX_RECORDED_HEARTBEATS;
            self.heartbeats.drain(..excess);
        }
    }

    /// Last sign of life: the latest heartbeat, or the start time.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeats
            .last()
            .copied()
            .unwrap_or(self.started_at)
            .max(self.started_at)
    }

    /// Close the attempt with an outcome.
    pub fn finish(&mut self, outcome: AttemptOutcome, output: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.output = if outcome.is_success() { output } else { None };
        self.outcome = Some(outcome);
    }
}

/// Which kind of error ended a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationRejected,
    ExecutionTimeout,
    ExecutionCrash,
    ProcessError,
    ParseError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ValidationRejected => "validation_rejected",
            FailureKind::ExecutionTimeout => "execution_timeout",
            FailureKind::ExecutionCrash => "execution_crash",
            FailureKind::ProcessError => "process_error",
            FailureKind::ParseError => "parse_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable reason attached to a FAILED task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Captured diagnostic output (stderr), if any.
    pub diagnostics: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        let diagnostics = diagnostics.into();
        self.diagnostics = if diagnostics.trim().is_empty() {
            None
        } else {
            Some(diagnostics)
        };
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
