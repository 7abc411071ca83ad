//! Lifecycle events and event handling.
//!
//! The orchestrator emits an [`Event`] after every committed state change
//! and around each execution attempt, enabling observability into scans.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::attempt::AttemptOutcome;
use crate::core::state::TaskState;
use crate::core::types::TaskId;

/// Lifecycle events emitted during orchestration.
#[derive(Debug, Clone)]
pub enum Event {
    /// A state transition was committed to storage.
    StateChanged {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
        timestamp: Instant,
    },

    /// An execution attempt was opened.
    AttemptStarted {
        task_id: TaskId,
        attempt: u32,
        timestamp: Instant,
    },

    /// An execution attempt was closed with an outcome.
    AttemptFinished {
        task_id: TaskId,
        attempt: u32,
        outcome: AttemptOutcome,
        timestamp: Instant,
    },

    /// A failed attempt will be retried after `delay`.
    ///
    /// Emitted before the backoff wait. `max_attempts` counts the first
    /// attempt too.
    TaskRetrying {
        task_id: TaskId,
        /// The attempt that just failed (1-indexed).
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        timestamp: Instant,
    },

    /// A non-terminal task found in storage was picked up again.
    TaskResumed {
        task_id: TaskId,
        state: TaskState,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::StateChanged { timestamp, .. } => *timestamp,
            Event::AttemptStarted { timestamp, .. } => *timestamp,
            Event::AttemptFinished { timestamp, .. } => *timestamp,
            Event::TaskRetrying { timestamp, .. } => *timestamp,
            Event::TaskResumed { timestamp, .. } => *timestamp,
        }
    }

    /// The task the event is about.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Event::StateChanged { task_id, .. }
            | Event::AttemptStarted { task_id, .. }
            | Event::AttemptFinished { task_id, .. }
            | Event::TaskRetrying { task_id, .. }
            | Event::TaskResumed { task_id, .. } => task_id,
        }
    }

    pub fn state_changed(task_id: TaskId, from: TaskState, to: TaskState) -> Self {
        Event::StateChanged {
            task_id,
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    pub fn attempt_started(task_id: TaskId, attempt: u32) -> Self {
        Event::AttemptStarted {
            task_id,
            attempt,
            timestamp: Instant::now(),
        }
    }

    pub fn attempt_finished(task_id: TaskId, attempt: u32, outcome: AttemptOutcome) -> Self {
        Event::AttemptFinished {
            task_id,
            attempt,
            outcome,
            timestamp: Instant::now(),
        }
    }

    pub fn task_retrying(
        task_id: TaskId,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    ) -> Self {
        Event::TaskRetrying {
            task_id,
            attempt,
            max_attempts,
            delay,
            timestamp: Instant::now(),
        }
    }

    pub fn task_resumed(task_id: TaskId, state: TaskState) -> Self {
        Event::TaskResumed {
            task_id,
            state,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
