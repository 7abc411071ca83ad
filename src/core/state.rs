//! Task lifecycle states and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a scan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Registered, waiting for an execution slot.
    Queued,
    /// Arguments are being checked.
    Validating,
    /// The external command is executing (possibly a retry).
    Running,
    /// Raw output is being turned into a result.
    Parsing,
    /// A result is available.
    Completed,
    /// The task failed; a failure reason is recorded.
    Failed,
    /// The task was cancelled before it finished.
    Cancelled,
}

/// Error returned when a state change is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    Illegal { from: TaskState, to: TaskState },

    #[error("task is already in terminal state {0}")]
    Terminal(TaskState),

    #[error("attempt budget exhausted ({0} attempts)")]
    AttemptBudgetExhausted(u32),

    #[error("no attempt in flight")]
    NoAttemptInFlight,

    #[error("attempt {0} is still in flight")]
    AttemptInFlight(u32),
}

impl TaskState {
    /// All states, in pipeline order.
    pub const ALL: [TaskState; 7] = [
        TaskState::Queued,
        TaskState::Validating,
        TaskState::Running,
        TaskState::Parsing,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Check a single step against the transition table.
    ///
    /// `Running -> Running` is the retry edge; the attempt budget is
    /// enforced by the record, not here.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Queued, Validating)
                | (Validating, Running)
                | (Validating, Failed)
                | (Running, Running)
                | (Running, Parsing)
                | (Running, Failed)
                | (Parsing, Completed)
                | (Parsing, Failed)
        )
    }

    /// Validate a step, producing a descriptive error.
    pub fn check_transition(self, next: TaskState) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self));
        }
        if !self.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self,
                to: next,
            });
        }
        Ok(())
    }

    /// Stable upper-case name used on the wire and in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "QUEUED",
            TaskState::Validating => "VALIDATING",
            TaskState::Running => "RUNNING",
            TaskState::Parsing => "PARSING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task state: {}", s))
    }
}
