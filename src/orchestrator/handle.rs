//! Orchestrator handle for controlling a running orchestrator.
//!
//! This module provides the `OrchestratorHandle` type that allows external control
//! of the orchestrator through commands like submit, cancel, and shutdown.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::state::TaskState;
use crate::core::types::TaskId;

use super::types::{OrchestratorCommand, OrchestratorError, OrchestratorState};

/// Buffer size for the command channel between OrchestratorHandle and Orchestrator.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    pub(crate) command_tx: mpsc::Sender<OrchestratorCommand>,
    pub(crate) state: Arc<RwLock<OrchestratorState>>,
}

impl OrchestratorHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(
            oneshot::Sender<Result<T, OrchestratorError>>,
        ) -> OrchestratorCommand,
        operation: &str,
    ) -> Result<T, OrchestratorError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                OrchestratorError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            OrchestratorError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command with a plain response and wait for it.
    async fn send_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCommand,
        operation: &str,
    ) -> Result<T, OrchestratorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                OrchestratorError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            OrchestratorError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Start driving a task that is already registered in storage.
    ///
    /// Submitting a task that is already being driven, or that is terminal,
    /// is a no-op.
    pub async fn submit(&self, task_id: impl Into<TaskId>) -> Result<(), OrchestratorError> {
        if !self.is_running().await {
            return Err(OrchestratorError::ShuttingDown);
        }
        let task_id = task_id.into();
        self.send_result_command(
            |response| OrchestratorCommand::Submit { task_id, response },
            "submit",
        )
        .await
    }

    /// Cancel a task, returning the state it ends in.
    ///
    /// A task that already reached a terminal state keeps it.
    pub async fn cancel(&self, task_id: impl Into<TaskId>) -> Result<TaskState, OrchestratorError> {
        let task_id = task_id.into();
        self.send_result_command(
            |response| OrchestratorCommand::Cancel { task_id, response },
            "cancel",
        )
        .await
    }

    /// Number of tasks currently being driven by this process.
    pub async fn active_count(&self) -> Result<usize, OrchestratorError> {
        self.send_command(
            |response| OrchestratorCommand::ActiveCount { response },
            "active count",
        )
        .await
    }

    /// Shutdown the orchestrator.
    ///
    /// Waits for running instances up to the shutdown timeout, then stops
    /// the rest. Persisted task state is left as is, so stopped tasks
    /// resume on the next start.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.send_command(
            |response| OrchestratorCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current orchestrator state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Check if the orchestrator is accepting work.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == OrchestratorState::Running
    }
}
