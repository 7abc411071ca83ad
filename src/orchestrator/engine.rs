//! Orchestrator engine implementation.
//!
//! The orchestrator is responsible for:
//! - Driving submitted tasks through validation, execution and parsing
//! - Bounding concurrent executions
//! - Resuming tasks left unfinished by a previous process
//! - Cooperative cancellation
//! - Graceful shutdown
//! - Event emission

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::retry::RetryPolicy;
use crate::core::state::TaskState;
use crate::core::types::TaskId;
use crate::events::{Event, EventBus};
use crate::execution::ScanRunner;
use crate::storage::{Storage, StorageError};
use crate::validation::Validator;

use super::handle::{COMMAND_CHANNEL_BUFFER, OrchestratorHandle};
use super::instance::{Instance, InstanceContext, TaskControl};
use super::types::{OrchestratorCommand, OrchestratorError, OrchestratorState};

/// Default number of concurrent executions.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default time without a heartbeat before an attempt is considered lost.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Tries to commit a cancellation when the record keeps changing.
const CANCEL_COMMIT_ATTEMPTS: u32 = 5;

/// How often finished instances are removed from the active set.
const CLEANUP_INTERVAL: Duration = Duration::from_millis(500);

struct ActiveTask {
    control: Arc<TaskControl>,
    handle: JoinHandle<()>,
}

/// Durable orchestrator for scan tasks.
///
/// Tasks are registered in storage first (as `QUEUED` records) and then
/// submitted by id. Every state change is committed before the next
/// stage runs, so [`Orchestrator::start`] can pick up any non-terminal
/// task found in storage.
pub struct Orchestrator<S: Storage> {
    storage: Arc<S>,
    runner: Arc<dyn ScanRunner>,
    validator: Validator,
    event_bus: Arc<EventBus>,
    max_workers: usize,
    retry_policy: RetryPolicy,
    heartbeat_timeout: Duration,
    liveness_check_interval: Duration,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
}

impl<S: Storage + 'static> Orchestrator<S> {
    /// Create a new orchestrator with the given storage and runner.
    pub fn new(storage: S, runner: Arc<dyn ScanRunner>) -> Self {
        Self::with_storage(Arc::new(storage), runner)
    }

    /// Create a new orchestrator with shared storage.
    pub fn with_storage(storage: Arc<S>, runner: Arc<dyn ScanRunner>) -> Self {
        Self {
            storage,
            runner,
            validator: Validator::new(),
            event_bus: Arc::new(EventBus::new()),
            max_workers: DEFAULT_MAX_WORKERS,
            retry_policy: RetryPolicy::default(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            liveness_check_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Set the maximum number of concurrent executions.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Set the retry policy for failed attempts.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set how long an attempt may go without a heartbeat.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set how often running attempts are checked for missed heartbeats.
    pub fn with_liveness_check_interval(mut self, interval: Duration) -> Self {
        self.liveness_check_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Get the shared storage.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Tasks left unfinished in storage, in creation order.
    ///
    /// These are the tasks [`Orchestrator::start`] resumes.
    pub async fn recover(&self) -> Result<Vec<TaskId>, OrchestratorError> {
        let incomplete = self.storage.get_incomplete_tasks().await?;
        Ok(incomplete.into_iter().map(|r| r.id().clone()).collect())
    }

    /// Start the orchestrator and return a handle for controlling it.
    ///
    /// Every non-terminal task in storage is resumed first.
    pub async fn start(self) -> (OrchestratorHandle, JoinHandle<()>) {
        let resumable = match self.recover().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list unfinished tasks, nothing resumed");
                Vec::new()
            }
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(OrchestratorState::Running));

        let handle = OrchestratorHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let context = Arc::new(InstanceContext {
            storage: Arc::clone(&self.storage),
            runner: Arc::clone(&self.runner),
            validator: self.validator,
            event_bus: Arc::clone(&self.event_bus),
            permits: Arc::new(Semaphore::new(self.max_workers)),
            retry_policy: self.retry_policy.clone(),
            heartbeat_timeout: self.heartbeat_timeout,
            liveness_check_interval: self.liveness_check_interval,
        });

        let mut engine = Engine {
            context,
            active: HashMap::new(),
            shutdown_timeout: self.shutdown_timeout,
        };

        if !resumable.is_empty() {
            info!(count = resumable.len(), "Resuming unfinished tasks");
        }
        for task_id in resumable {
            engine.spawn_instance(task_id, true);
        }

        let task = tokio::spawn(async move {
            engine.run(command_rx, state).await;
        });

        (handle, task)
    }
}

/// The running side of an orchestrator, owned by its actor task.
struct Engine<S: Storage> {
    context: Arc<InstanceContext<S>>,
    active: HashMap<TaskId, ActiveTask>,
    shutdown_timeout: Duration,
}

impl<S: Storage + 'static> Engine<S> {
    /// Main orchestrator loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<OrchestratorCommand>,
        state: Arc<RwLock<OrchestratorState>>,
    ) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    self.cleanup_finished();
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All orchestrator handles dropped, shutting down");
                        self.shutdown(&state).await;
                        break;
                    };
                    match command {
                        OrchestratorCommand::Submit { task_id, response } => {
                            let result = self.submit(task_id).await;
                            let _ = response.send(result);
                        }
                        OrchestratorCommand::Cancel { task_id, response } => {
                            let result = self.cancel(&task_id).await;
                            let _ = response.send(result);
                        }
                        OrchestratorCommand::ActiveCount { response } => {
                            self.cleanup_finished();
                            let _ = response.send(self.active.len());
                        }
                        OrchestratorCommand::Shutdown { response } => {
                            self.shutdown(&state).await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn submit(&mut self, task_id: TaskId) -> Result<(), OrchestratorError> {
        if let Some(active) = self.active.get(&task_id) {
            if !active.handle.is_finished() {
                debug!(task_id = %task_id, "Task is already being driven");
                return Ok(());
            }
        }

        let record = self.context.storage.get_task(&task_id).await?;
        if record.state().is_terminal() {
            debug!(task_id = %task_id, state = %record.state(), "Task already finished, nothing to do");
            return Ok(());
        }

        self.spawn_instance(task_id, false);
        Ok(())
    }

    fn spawn_instance(&mut self, task_id: TaskId, resumed: bool) {
        let control = Arc::new(TaskControl::new());
        let instance = Instance::new(
            task_id.clone(),
            Arc::clone(&self.context),
            Arc::clone(&control),
            resumed,
        );
        let handle = tokio::spawn(instance.run());
        self.active.insert(task_id, ActiveTask { control, handle });
    }

    /// Cancel a task and commit `CANCELLED` unless it is already terminal.
    async fn cancel(&mut self, task_id: &TaskId) -> Result<TaskState, OrchestratorError> {
        let control = self.active.get(task_id).map(|a| Arc::clone(&a.control));

        // Held until the cancellation is committed, so the instance cannot
        // commit anything after the token fires.
        let _guard = match control.as_ref() {
            Some(control) => Some(control.commit_lock.lock().await),
            None => None,
        };
        if let Some(control) = control.as_ref() {
            control.cancel.cancel();
        }

        let storage = &self.context.storage;
        for _ in 0..CANCEL_COMMIT_ATTEMPTS {
            let mut record = storage.get_task(task_id).await?;
            let from = record.state();
            if from.is_terminal() {
                debug!(task_id = %task_id, state = %from, "Cancel requested for finished task");
                return Ok(from);
            }

            record.cancel()?;
            match storage.update_task(&mut record).await {
                Ok(()) => {
                    info!(task_id = %task_id, from = %from, "Task cancelled");
                    self.context
                        .event_bus
                        .emit(Event::state_changed(task_id.clone(), from, TaskState::Cancelled))
                        .await;
                    return Ok(TaskState::Cancelled);
                }
                Err(StorageError::Conflict { .. }) => {
                    debug!(task_id = %task_id, "Record changed during cancel, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(OrchestratorError::Contended(task_id.to_string()))
    }

    /// Clean up finished instance handles.
    fn cleanup_finished(&mut self) {
        self.active.retain(|_, active| !active.handle.is_finished());
    }

    async fn shutdown(&mut self, state: &RwLock<OrchestratorState>) {
        *state.write().await = OrchestratorState::ShuttingDown;

        // Instances still waiting for capacity stop without touching storage.
        self.context.permits.close();
        self.await_active().await;

        for (task_id, active) in self.active.drain() {
            if !active.handle.is_finished() {
                warn!(task_id = %task_id, "Stopping task instance; it resumes on next start");
                active.handle.abort();
            }
        }

        *state.write().await = OrchestratorState::Stopped;
        info!("Orchestrator stopped");
    }

    /// Wait for all active instances to finish with a timeout.
    async fn await_active(&mut self) {
        self.cleanup_finished();
        let running_count = self.active.len();

        if running_count == 0 {
            info!("No running tasks to wait for during shutdown");
            return;
        }

        info!(
            "Graceful shutdown: waiting for {} running task(s) to finish (timeout: {:?})",
            running_count, self.shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        let deadline = start + self.shutdown_timeout;

        loop {
            self.cleanup_finished();
            let remaining = self.active.len();

            if remaining == 0 {
                info!("All running tasks finished gracefully in {:?}", start.elapsed());
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} task(s) still running",
                    self.shutdown_timeout, remaining
                );
                break;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
