//! Orchestrator type definitions.
//!
//! This module contains error types, state enums, and command types for the orchestrator.

use crate::core::state::{TaskState, TransitionError};
use crate::core::types::TaskId;
use crate::storage::StorageError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur in the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Task not found in storage.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// A state change was rejected.
    #[error("invalid transition: {0}")]
    Transition(#[from] TransitionError),

    /// The record kept changing underneath a cancel request.
    #[error("concurrent updates to task {0}, try again")]
    Contended(String),

    /// The orchestrator is shutting down and accepts no new work.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

impl From<StorageError> for OrchestratorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => OrchestratorError::TaskNotFound(what),
            other => OrchestratorError::Storage(other),
        }
    }
}

/// State of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Accepting and driving tasks.
    Running,
    /// Waiting for in-flight instances before stopping.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

/// Commands that can be sent to the orchestrator.
pub(crate) enum OrchestratorCommand {
    /// Start driving a registered task.
    Submit {
        task_id: TaskId,
        response: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    /// Cancel a task; responds with its final state.
    Cancel {
        task_id: TaskId,
        response: oneshot::Sender<Result<TaskState, OrchestratorError>>,
    },
    /// Number of task instances currently being driven.
    ActiveCount { response: oneshot::Sender<usize> },
    /// Shutdown the orchestrator.
    Shutdown { response: oneshot::Sender<()> },
}
