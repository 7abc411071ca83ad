//! Storage abstraction for persisting scan task records.
//!
//! Every task has exactly one [`TaskRecord`]. Writers update it with a
//! compare-and-swap on [`TaskRecord::version`], so a stale writer gets
//! [`StorageError::Conflict`] instead of overwriting newer state.

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::attempt::{AttemptOutcome, ExecutionAttempt, Failure};
use crate::core::state::{TaskState, TransitionError};
use crate::core::task::ScanTask;
use crate::core::types::TaskId;
use crate::parser::ScanResult;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The record changed since it was read.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// The backend is temporarily unreachable; the operation may be retried.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// The persisted record of one scan task.
///
/// Mutators enforce the record invariants: a result exists only in
/// `COMPLETED`, a failure only in `FAILED`, and a new attempt can only
/// begin once the previous one has an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub(crate) task: ScanTask,
    pub(crate) state: TaskState,
    pub(crate) attempts: Vec<ExecutionAttempt>,
    pub(crate) result: Option<ScanResult>,
    pub(crate) failure: Option<Failure>,
    pub(crate) cancel_requested: bool,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) version: u64,
}

impl TaskRecord {
    /// A fresh `QUEUED` record for a task.
    pub fn new(task: ScanTask) -> Self {
        let updated_at = task.created_at();
        Self {
            task,
            state: TaskState::Queued,
            attempts: Vec::new(),
            result: None,
            failure: None,
            cancel_requested: false,
            updated_at,
            version: 0,
        }
    }

    pub fn id(&self) -> &TaskId {
        self.task.id()
    }

    pub fn task(&self) -> &ScanTask {
        &self.task
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn attempts(&self) -> &[ExecutionAttempt] {
        &self.attempts
    }

    /// The most recent attempt, if any.
    pub fn current_attempt(&self) -> Option<&ExecutionAttempt> {
        self.attempts.last()
    }

    pub fn result(&self) -> Option<&ScanResult> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Version the record had when it was read.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// `QUEUED -> VALIDATING`.
    pub fn start_validation(&mut self) -> Result<(), TransitionError> {
        self.move_to(TaskState::Validating)
    }

    /// Open attempt `n+1`, entering (or staying in) `RUNNING`.
    ///
    /// Returns the new attempt number.
    pub fn begin_attempt(&mut self, max_attempts: u32) -> Result<u32, TransitionError> {
        if let Some(current) = self.current_attempt() {
            if current.is_in_flight() {
                return Err(TransitionError::AttemptInFlight(current.number));
            }
        }
        let made = self.attempts.len() as u32;
        if made >= max_attempts {
            return Err(TransitionError::AttemptBudgetExhausted(made));
        }
        self.move_to(TaskState::Running)?;
        let number = made + 1;
        self.attempts.push(ExecutionAttempt::new(number));
        Ok(number)
    }

    /// Record a heartbeat on the in-flight attempt.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        let attempt = self.in_flight_attempt()?;
        attempt.record_heartbeat(at);
        self.touch();
        Ok(())
    }

    /// Close the in-flight attempt.
    ///
    /// A successful outcome moves the task to `PARSING` in the same
    /// step, keeping the raw output on the attempt. Other outcomes leave
    /// the task in `RUNNING` for the caller to retry or fail.
    pub fn finish_attempt(
        &mut self,
        outcome: AttemptOutcome,
        output: Option<String>,
    ) -> Result<(), TransitionError> {
        let success = outcome.is_success();
        if success {
            self.state.check_transition(TaskState::Parsing)?;
        }
        self.in_flight_attempt()?.finish(outcome, output);
        if success {
            self.state = TaskState::Parsing;
        }
        self.touch();
        Ok(())
    }

    /// Raw output of the successful attempt awaiting parsing.
    pub fn pending_output(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find(|a| matches!(a.outcome, Some(AttemptOutcome::Succeeded)))
            .and_then(|a| a.output.as_deref())
    }

    /// `PARSING -> COMPLETED` with the parsed result.
    pub fn complete(&mut self, result: ScanResult) -> Result<(), TransitionError> {
        self.state.check_transition(TaskState::Completed)?;
        self.result = Some(result);
        self.state = TaskState::Completed;
        self.touch();
        Ok(())
    }

    /// Move to `FAILED` with a reason.
    pub fn fail(&mut self, failure: Failure) -> Result<(), TransitionError> {
        self.state.check_transition(TaskState::Failed)?;
        self.failure = Some(failure);
        self.result = None;
        self.state = TaskState::Failed;
        self.touch();
        Ok(())
    }

    /// Move to `CANCELLED` from any non-terminal state.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.state.check_transition(TaskState::Cancelled)?;
        self.cancel_requested = true;
        self.state = TaskState::Cancelled;
        self.touch();
        Ok(())
    }

    fn move_to(&mut self, next: TaskState) -> Result<(), TransitionError> {
        self.state.check_transition(next)?;
        self.state = next;
        self.touch();
        Ok(())
    }

    fn in_flight_attempt(&mut self) -> Result<&mut ExecutionAttempt, TransitionError> {
        if self.state != TaskState::Running {
            return Err(TransitionError::NoAttemptInFlight);
        }
        self.attempts
            .last_mut()
            .filter(|a| a.is_in_flight())
            .ok_or(TransitionError::NoAttemptInFlight)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Storage trait for persisting task records.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new record. Fails with `DuplicateKey` if the id exists.
    async fn insert_task(&self, record: TaskRecord) -> Result<(), StorageError>;

    /// Get a record by task id.
    async fn get_task(&self, id: &TaskId) -> Result<TaskRecord, StorageError>;

    /// List all records, ordered by creation time, ties by insertion order.
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StorageError>;

    /// Replace a record if its stored version still equals `record.version()`.
    ///
    /// On success the record's version is advanced to match storage.
    async fn update_task(&self, record: &mut TaskRecord) -> Result<(), StorageError>;

    /// Records not in a terminal state, in creation order.
    async fn get_incomplete_tasks(&self) -> Result<Vec<TaskRecord>, StorageError>;
}
