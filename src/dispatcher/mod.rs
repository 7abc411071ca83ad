//! Front-end dispatcher.
//!
//! Turns caller requests into registered, submitted tasks and answers
//! queries through the [`Registry`]. It never validates, executes or
//! parses anything itself.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::state::TaskState;
use crate::core::task::ScanTask;
use crate::core::types::TaskId;
use crate::orchestrator::{OrchestratorError, OrchestratorHandle};
use crate::parser::ScanResult;
use crate::registry::{Registry, RegistryError, TaskSummary};
use crate::storage::{Storage, TaskRecord};

/// Default ceiling for [`Dispatcher::run_and_wait`].
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default interval between status polls while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors returned by dispatcher operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// The task did not finish within the wait ceiling.
    ///
    /// The task keeps running; poll it by id.
    #[error("scan {id} still {state} after {waited:?}")]
    WaitTimeout {
        id: TaskId,
        state: TaskState,
        waited: Duration,
    },
}

/// Entry point for starting and querying scans.
pub struct Dispatcher<S: Storage> {
    registry: Registry<S>,
    orchestrator: OrchestratorHandle,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl<S: Storage> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            orchestrator: self.orchestrator.clone(),
            wait_timeout: self.wait_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

impl<S: Storage> Dispatcher<S> {
    /// Create a dispatcher over a registry and a running orchestrator.
    pub fn new(registry: Registry<S>, orchestrator: OrchestratorHandle) -> Self {
        Self {
            registry,
            orchestrator,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the ceiling for [`Dispatcher::run_and_wait`].
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set how often [`Dispatcher::run_and_wait`] polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &OrchestratorHandle {
        &self.orchestrator
    }

    /// Register and submit a scan, returning as soon as it is queued.
    pub async fn start(
        &self,
        target: impl Into<String>,
        arguments: Vec<String>,
        label: Option<String>,
    ) -> Result<TaskId, DispatchError> {
        let task = ScanTask::new(target, arguments, label);
        let id = self.registry.register(task).await?;

        if let Err(e) = self.orchestrator.submit(id.clone()).await {
            warn!(task_id = %id, error = %e, "Task registered but not submitted; it stays queued");
            return Err(e.into());
        }
        info!(task_id = %id, "Scan started");
        Ok(id)
    }

    /// Current state of a scan.
    pub async fn poll(&self, id: &TaskId) -> Result<TaskState, DispatchError> {
        Ok(self.registry.get_status(id).await?)
    }

    /// The result of a completed scan.
    pub async fn fetch(&self, id: &TaskId) -> Result<ScanResult, DispatchError> {
        Ok(self.registry.get_result(id).await?)
    }

    /// All scans, oldest first.
    pub async fn list(&self) -> Result<Vec<TaskSummary>, DispatchError> {
        Ok(self.registry.list().await?)
    }

    /// The full record of a scan.
    pub async fn describe(&self, id: &TaskId) -> Result<TaskRecord, DispatchError> {
        Ok(self.registry.describe(id).await?)
    }

    /// Cancel a scan, returning the state it ends in.
    pub async fn cancel(&self, id: &TaskId) -> Result<TaskState, DispatchError> {
        let state = self.orchestrator.cancel(id.clone()).await?;
        Ok(state)
    }

    /// Start a scan and wait until it is terminal.
    ///
    /// Returns the final record, or [`DispatchError::WaitTimeout`] once the
    /// wait ceiling passes. The scan itself is not cancelled on timeout.
    pub async fn run_and_wait(
        &self,
        target: impl Into<String>,
        arguments: Vec<String>,
        label: Option<String>,
    ) -> Result<TaskRecord, DispatchError> {
        let id = self.start(target, arguments, label).await?;
        self.wait(&id).await
    }

    /// Wait for an existing scan to reach a terminal state.
    pub async fn wait(&self, id: &TaskId) -> Result<TaskRecord, DispatchError> {
        let start = tokio::time::Instant::now();
        loop {
            let record = self.registry.describe(id).await?;
            if record.state().is_terminal() {
                debug!(task_id = %id, state = %record.state(), "Scan finished");
                return Ok(record);
            }
            if start.elapsed() >= self.wait_timeout {
                return Err(DispatchError::WaitTimeout {
                    id: id.clone(),
                    state: record.state(),
                    waited: self.wait_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
