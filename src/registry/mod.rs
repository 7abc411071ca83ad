//! Task registry: a read-through view of the task store.
//!
//! The registry writes the initial `QUEUED` record for a task and answers
//! status, result and listing queries straight from storage. It keeps no
//! state of its own, so every query reflects the last committed state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::core::state::TaskState;
use crate::core::task::ScanTask;
use crate::core::types::TaskId;
use crate::parser::ScanResult;
use crate::storage::{Storage, StorageError, TaskRecord};

/// Errors returned by registry queries.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No task with this identifier exists.
    #[error("scan not found: {0}")]
    NotFound(TaskId),

    /// The task exists but has no result in its current state.
    #[error("scan {id} has no result yet (status: {state})")]
    NotAvailable { id: TaskId, state: TaskState },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One line of a task listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub state: TaskState,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl From<&TaskRecord> for TaskSummary {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id().clone(),
            state: record.state(),
            label: record.task().label().to_string(),
            created_at: record.task().created_at(),
        }
    }
}

/// Read-through registry over a [`Storage`] backend.
pub struct Registry<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: Storage> Registry<S> {
    /// Create a registry over shared storage.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Get the shared storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Persist a new task as `QUEUED` and return its identifier.
    pub async fn register(&self, task: ScanTask) -> Result<TaskId, RegistryError> {
        let id = task.id().clone();
        self.storage.insert_task(TaskRecord::new(task)).await?;
        tracing::debug!(task_id = %id, "Task registered");
        Ok(id)
    }

    /// Current state of a task.
    pub async fn get_status(&self, id: &TaskId) -> Result<TaskState, RegistryError> {
        Ok(self.describe(id).await?.state())
    }

    /// The parsed result of a completed task.
    pub async fn get_result(&self, id: &TaskId) -> Result<ScanResult, RegistryError> {
        let record = self.describe(id).await?;
        match (record.state(), record.result()) {
            (TaskState::Completed, Some(result)) => Ok(result.clone()),
            (state, _) => Err(RegistryError::NotAvailable {
                id: id.clone(),
                state,
            }),
        }
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Result<Vec<TaskSummary>, RegistryError> {
        let records = self.storage.list_tasks().await?;
        Ok(records.iter().map(TaskSummary::from).collect())
    }

    /// The full record of a task, including attempts and failure.
    pub async fn describe(&self, id: &TaskId) -> Result<TaskRecord, RegistryError> {
        self.storage.get_task(id).await.map_err(|e| match e {
            StorageError::NotFound(_) => RegistryError::NotFound(id.clone()),
            other => RegistryError::Storage(other),
        })
    }
}
