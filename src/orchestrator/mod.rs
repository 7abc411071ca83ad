//! Durable task orchestration.
//!
//! The [`Orchestrator`] drives registered scan tasks through the
//! `QUEUED -> VALIDATING -> RUNNING -> PARSING -> COMPLETED` pipeline,
//! committing every transition to storage. It runs as an actor; control
//! it through the [`OrchestratorHandle`] returned by [`Orchestrator::start`].

mod engine;
mod handle;
mod instance;
mod types;

pub use engine::{DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_MAX_WORKERS, Orchestrator};
pub use handle::OrchestratorHandle;
pub use types::{OrchestratorError, OrchestratorState};
