//! One task's pipeline: validate, run, parse.
//!
//! An [`Instance`] drives a single task record from whatever state it
//! was last committed in to a terminal state. Every step is committed
//! before the next one starts, so a new instance built from the same
//! record continues where the previous one stopped.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::attempt::{AttemptOutcome, Failure, FailureKind};
use crate::core::retry::RetryPolicy;
use crate::core::state::{TaskState, TransitionError};
use crate::core::types::TaskId;
use crate::events::{Event, EventBus};
use crate::execution::{RunRequest, ScanRunner};
use crate::parser::parse_scan_output;
use crate::storage::{Storage, StorageError, TaskRecord};
use crate::validation::Validator;

/// Heartbeats buffered between the runner and the instance.
const HEARTBEAT_CHANNEL_BUFFER: usize = 16;

/// First delay before retrying a transient storage failure.
const STORAGE_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(50);

/// Tries per commit when storage is temporarily unavailable.
const STORAGE_RETRY_ATTEMPTS: u32 = 5;

/// First pause before an instance stopped by a storage outage starts over.
const RESTART_INITIAL_DELAY: Duration = Duration::from_millis(500);

const RESTART_MAX_DELAY: Duration = Duration::from_secs(30);

/// Raw output kept as diagnostics when parsing fails.
const PARSE_DIAGNOSTICS_CHARS: usize = 512;

/// Shared by every instance of one orchestrator.
pub(crate) struct InstanceContext<S: Storage> {
    pub(crate) storage: Arc<S>,
    pub(crate) runner: Arc<dyn ScanRunner>,
    pub(crate) validator: Validator,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) liveness_check_interval: Duration,
}

/// Per-task cancellation state, shared with the orchestrator.
///
/// Cancel holds `commit_lock` while firing `cancel`; instances check the
/// token under the same lock before every commit.
pub(crate) struct TaskControl {
    pub(crate) cancel: CancellationToken,
    pub(crate) commit_lock: Mutex<()>,
}

impl TaskControl {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            commit_lock: Mutex::new(()),
        }
    }
}

/// Why an instance stopped before reaching a terminal state.
#[derive(Debug)]
enum Stop {
    Cancelled,
    /// Another writer committed first.
    Superseded,
    /// The orchestrator is shutting down.
    Shutdown,
    Storage(StorageError),
    Transition(TransitionError),
}

impl From<StorageError> for Stop {
    fn from(e: StorageError) -> Self {
        Stop::Storage(e)
    }
}

pub(crate) struct Instance<S: Storage> {
    task_id: TaskId,
    ctx: Arc<InstanceContext<S>>,
    control: Arc<TaskControl>,
    resumed: bool,
    /// Attempt opened by this instance, as opposed to one found in storage.
    owned_attempt: Option<u32>,
    /// Attempt whose run was dropped when a storage outage stopped this instance.
    abandoned_attempt: Option<u32>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<S: Storage + 'static> Instance<S> {
    pub(crate) fn new(
        task_id: TaskId,
        ctx: Arc<InstanceContext<S>>,
        control: Arc<TaskControl>,
        resumed: bool,
    ) -> Self {
        Self {
            task_id,
            ctx,
            control,
            resumed,
            owned_attempt: None,
            abandoned_attempt: None,
            permit: None,
        }
    }

    /// Drive the task until it is terminal or the instance has to stop.
    ///
    /// A transient storage failure that outlasts the commit retries does
    /// not end the instance: it backs off and starts over from the last
    /// committed state.
    pub(crate) async fn run(mut self) {
        let mut restart_delay = RESTART_INITIAL_DELAY;
        loop {
            match self.drive().await {
                Ok(state) => {
                    info!(task_id = %self.task_id, state = %state, "Task finished");
                }
                Err(Stop::Cancelled) => {
                    debug!(task_id = %self.task_id, "Task instance stopped by cancellation");
                }
                Err(Stop::Shutdown) => {
                    debug!(task_id = %self.task_id, "Task instance stopped by shutdown");
                }
                Err(Stop::Superseded) => {
                    warn!(task_id = %self.task_id, "Task record was updated elsewhere, stopping this instance");
                }
                Err(Stop::Storage(e)) if e.is_transient() => {
                    warn!(
                        task_id = %self.task_id,
                        error = %e,
                        retry_in = ?restart_delay,
                        "Storage still unavailable, restarting the task after a pause"
                    );
                    if self.pause_before_restart(restart_delay).await {
                        restart_delay = (restart_delay * 2).min(RESTART_MAX_DELAY);
                        continue;
                    }
                }
                Err(Stop::Storage(e)) => {
                    error!(
                        task_id = %self.task_id,
                        error = %e,
                        "Storage failure, stopping; the task resumes from its last committed state"
                    );
                }
                Err(Stop::Transition(e)) => {
                    error!(task_id = %self.task_id, error = %e, "Rejected state change, stopping");
                }
            }
            return;
        }
    }

    /// Give up capacity and wait before starting over.
    ///
    /// Returns `false` if the task was cancelled or the orchestrator is
    /// shutting down in the meantime.
    async fn pause_before_restart(&mut self, delay: Duration) -> bool {
        self.permit = None;
        self.resumed = true;
        if let Some(attempt) = self.owned_attempt.take() {
            self.abandoned_attempt = Some(attempt);
        }
        if self.ctx.permits.is_closed() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.ctx.permits.is_closed(),
            _ = self.control.cancel.cancelled() => false,
        }
    }

    async fn drive(&mut self) -> Result<TaskState, Stop> {
        let mut record = self.load().await?;

        if self.resumed && record.state() != TaskState::Queued {
            info!(task_id = %self.task_id, state = %record.state(), "Resuming task");
            self.ctx
                .event_bus
                .emit(Event::task_resumed(self.task_id.clone(), record.state()))
                .await;
        }

        loop {
            if self.control.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }

            match record.state() {
                TaskState::Queued => {
                    self.acquire_permit().await?;
                    self.commit(&mut record, |r| r.start_validation()).await?;
                }
                TaskState::Validating => {
                    self.acquire_permit().await?;
                    self.validate(&mut record).await?;
                }
                TaskState::Running => self.step_running(&mut record).await?,
                TaskState::Parsing => self.parse(&mut record).await?,
                terminal => return Ok(terminal),
            }
        }
    }

    async fn load(&self) -> Result<TaskRecord, Stop> {
        let mut delay = STORAGE_RETRY_INITIAL_DELAY;
        let mut tries = 1;
        loop {
            match self.ctx.storage.get_task(&self.task_id).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && tries < STORAGE_RETRY_ATTEMPTS => {
                    warn!(task_id = %self.task_id, error = %e, "Storage unavailable, retrying load");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    tries += 1;
                }
                Err(e) => return Err(Stop::Storage(e)),
            }
        }
    }

    async fn acquire_permit(&mut self) -> Result<(), Stop> {
        if self.permit.is_some() {
            return Ok(());
        }
        let permits = Arc::clone(&self.ctx.permits);
        tokio::select! {
            permit = permits.acquire_owned() => {
                self.permit = Some(permit.map_err(|_| Stop::Shutdown)?);
                Ok(())
            }
            _ = self.control.cancel.cancelled() => Err(Stop::Cancelled),
        }
    }

    async fn validate(&mut self, record: &mut TaskRecord) -> Result<(), Stop> {
        let checked = self
            .ctx
            .validator
            .validate(record.task().target(), record.task().arguments());

        match checked {
            Ok(input) => {
                if input.requires_raw_socket {
                    info!(
                        task_id = %self.task_id,
                        "Scan mode needs raw-socket privileges; it fails with a process error without them"
                    );
                }
                self.begin_attempt(record).await
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Scan input rejected");
                let failure = Failure::new(FailureKind::ValidationRejected, e.to_string());
                self.commit(record, |r| r.fail(failure)).await
            }
        }
    }

    async fn begin_attempt(&mut self, record: &mut TaskRecord) -> Result<(), Stop> {
        self.acquire_permit().await?;
        let max_attempts = self.ctx.retry_policy.max_attempts;
        let mut opened = 0;
        self.commit(record, |r| {
            opened = r.begin_attempt(max_attempts)?;
            Ok(())
        })
        .await?;

        self.owned_attempt = Some(opened);
        info!(task_id = %self.task_id, attempt = opened, max_attempts, "Starting execution attempt");
        self.ctx
            .event_bus
            .emit(Event::attempt_started(self.task_id.clone(), opened))
            .await;
        Ok(())
    }

    async fn step_running(&mut self, record: &mut TaskRecord) -> Result<(), Stop> {
        let Some(current) = record.current_attempt().cloned() else {
            return self.begin_attempt(record).await;
        };

        if current.is_in_flight() {
            if self.owned_attempt == Some(current.number) {
                return self.execute_attempt(record, current.number).await;
            }
            if self.abandoned_attempt == Some(current.number) {
                // Its process was dropped with the previous run of this instance.
                let outcome = AttemptOutcome::Crashed {
                    reason: "attempt stopped by a storage failure".to_string(),
                };
                self.finish_attempt(record, outcome, None).await?;
                self.abandoned_attempt = None;
                return Ok(());
            }
            return self.reap_orphaned_attempt(record, current.last_seen()).await;
        }

        let Some(outcome) = current.outcome.clone() else {
            return Err(Stop::Transition(TransitionError::NoAttemptInFlight));
        };
        let policy = &self.ctx.retry_policy;

        if policy.should_retry(current.number) {
            let delay = policy.delay_after(current.number);
            let finished_at = current.finished_at.unwrap_or_else(Utc::now);
            let resume_at = finished_at + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            let remaining = (resume_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            warn!(
                task_id = %self.task_id,
                attempt = current.number,
                max_attempts = policy.max_attempts,
                delay = ?remaining,
                "Attempt failed, retrying after backoff"
            );
            self.ctx
                .event_bus
                .emit(Event::task_retrying(
                    self.task_id.clone(),
                    current.number,
                    policy.max_attempts,
                    delay,
                ))
                .await;

            // Capacity is released while waiting.
            self.permit = None;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.control.cancel.cancelled() => return Err(Stop::Cancelled),
            }
            return self.begin_attempt(record).await;
        }

        let failure = outcome
            .to_failure(current.number)
            .unwrap_or_else(|| Failure::new(FailureKind::ExecutionCrash, "attempt ended without a result"));
        warn!(task_id = %self.task_id, failure = %failure, "Attempt budget exhausted");
        self.commit(record, |r| r.fail(failure)).await
    }

    /// Close an attempt whose supervising process went away.
    ///
    /// Waits until the heartbeat timeout has passed since its last sign of
    /// life, then records it as crashed.
    async fn reap_orphaned_attempt(
        &mut self,
        record: &mut TaskRecord,
        last_seen: chrono::DateTime<Utc>,
    ) -> Result<(), Stop> {
        let timeout = self.ctx.heartbeat_timeout;
        let expires = last_seen + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let remaining = (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        info!(
            task_id = %self.task_id,
            wait = ?remaining,
            "Found an attempt without a live worker, waiting for its heartbeat to expire"
        );
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = self.control.cancel.cancelled() => return Err(Stop::Cancelled),
        }

        let outcome = AttemptOutcome::Crashed {
            reason: format!("no heartbeat within {:?}", timeout),
        };
        self.finish_attempt(record, outcome, None).await
    }

    async fn execute_attempt(&mut self, record: &mut TaskRecord, attempt: u32) -> Result<(), Stop> {
        let request = RunRequest {
            task_id: self.task_id.clone(),
            attempt,
            target: record.task().target().to_string(),
            arguments: record.task().arguments().to_vec(),
        };

        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(HEARTBEAT_CHANNEL_BUFFER);
        let attempt_token = self.control.cancel.child_token();
        let runner = Arc::clone(&self.ctx.runner);
        let run = runner.run(&request, heartbeat_tx, attempt_token.clone());
        tokio::pin!(run);

        let heartbeat_timeout = self.ctx.heartbeat_timeout;
        let mut liveness = tokio::time::interval(self.ctx.liveness_check_interval);
        let mut last_beat = Instant::now();
        let mut lost_heartbeat = false;

        let (outcome, output) = loop {
            tokio::select! {
                finished = &mut run => {
                    if let Some(result) = finished.into_attempt_outcome() {
                        break result;
                    }
                    if self.control.cancel.is_cancelled() {
                        return Err(Stop::Cancelled);
                    }
                    let outcome = if lost_heartbeat {
                        AttemptOutcome::TimedOut {
                            reason: format!("no heartbeat within {:?}", heartbeat_timeout),
                        }
                    } else {
                        AttemptOutcome::Crashed { reason: "runner stopped without a result".to_string() }
                    };
                    break (outcome, None);
                }
                Some(beat) = heartbeat_rx.recv() => {
                    last_beat = Instant::now();
                    // Losing one heartbeat write is harmless; the next one catches up.
                    match self.commit_with(record, 1, |r| r.record_heartbeat(beat.at)).await {
                        Err(Stop::Storage(e)) if e.is_transient() => {
                            warn!(task_id = %self.task_id, attempt, error = %e, "Heartbeat not persisted");
                        }
                        other => other?,
                    }
                }
                _ = liveness.tick() => {
                    if !lost_heartbeat && last_beat.elapsed() > heartbeat_timeout {
                        warn!(
                            task_id = %self.task_id,
                            attempt,
                            timeout = ?heartbeat_timeout,
                            "No heartbeat from running attempt, stopping it"
                        );
                        lost_heartbeat = true;
                        attempt_token.cancel();
                    }
                }
            }
        };

        self.finish_attempt(record, outcome, output).await
    }

    async fn finish_attempt(
        &mut self,
        record: &mut TaskRecord,
        outcome: AttemptOutcome,
        output: Option<String>,
    ) -> Result<(), Stop> {
        let attempt = record.current_attempt().map(|a| a.number).unwrap_or_default();
        let recorded = outcome.clone();
        self.commit(record, |r| r.finish_attempt(outcome, output))
            .await?;

        match &recorded {
            AttemptOutcome::Succeeded => {
                info!(task_id = %self.task_id, attempt, "Attempt succeeded");
            }
            other => {
                warn!(task_id = %self.task_id, attempt, outcome = ?other, "Attempt failed");
            }
        }
        self.ctx
            .event_bus
            .emit(Event::attempt_finished(self.task_id.clone(), attempt, recorded))
            .await;
        Ok(())
    }

    async fn parse(&mut self, record: &mut TaskRecord) -> Result<(), Stop> {
        // Parsing needs no execution slot.
        self.permit = None;

        let Some(output) = record.pending_output().map(str::to_owned) else {
            let failure = Failure::new(FailureKind::ParseError, "no output recorded for parsing");
            return self.commit(record, |r| r.fail(failure)).await;
        };

        match parse_scan_output(&output) {
            Ok(result) => {
                info!(
                    task_id = %self.task_id,
                    hosts = result.hosts.len(),
                    open_ports = result.open_ports().count(),
                    "Scan output parsed"
                );
                self.commit(record, |r| r.complete(result)).await
            }
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Scan output could not be parsed");
                let excerpt: String = output.chars().take(PARSE_DIAGNOSTICS_CHARS).collect();
                let failure = Failure::new(FailureKind::ParseError, e.to_string()).with_diagnostics(excerpt);
                self.commit(record, |r| r.fail(failure)).await
            }
        }
    }

    /// Apply `mutate` to a copy of the record and persist it.
    ///
    /// The in-memory record only changes once storage accepted the new
    /// version. Transient storage errors are retried with a doubling delay.
    async fn commit<F>(&self, record: &mut TaskRecord, mutate: F) -> Result<(), Stop>
    where
        F: FnOnce(&mut TaskRecord) -> Result<(), TransitionError>,
    {
        self.commit_with(record, STORAGE_RETRY_ATTEMPTS, mutate).await
    }

    /// [`Self::commit`] with at most `max_tries` writes.
    async fn commit_with<F>(
        &self,
        record: &mut TaskRecord,
        max_tries: u32,
        mutate: F,
    ) -> Result<(), Stop>
    where
        F: FnOnce(&mut TaskRecord) -> Result<(), TransitionError>,
    {
        let _guard = self.control.commit_lock.lock().await;
        if self.control.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }

        let from = record.state();
        let mut next = record.clone();
        mutate(&mut next).map_err(Stop::Transition)?;

        let mut delay = STORAGE_RETRY_INITIAL_DELAY;
        let mut tries = 1;
        loop {
            match self.ctx.storage.update_task(&mut next).await {
                Ok(()) => break,
                Err(StorageError::Conflict { .. }) => return Err(Stop::Superseded),
                Err(e) if e.is_transient() && tries < max_tries => {
                    warn!(
                        task_id = %self.task_id,
                        error = %e,
                        retry_in = ?delay,
                        "Storage unavailable, retrying commit"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    tries += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        *record = next;
        let to = record.state();
        if from != to {
            debug!(task_id = %self.task_id, from = %from, to = %to, "State committed");
            self.ctx
                .event_bus
                .emit(Event::state_changed(self.task_id.clone(), from, to))
                .await;
        }
        Ok(())
    }
}
