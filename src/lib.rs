//! scanward - durable orchestration of long-running nmap scans.
//!
//! A scan is registered as a `QUEUED` task record, then driven through
//! validation, execution of the scanner and parsing of its XML output.
//! Every stage boundary is committed to storage, so a task survives the
//! process that started it and resumes where it stopped.
//!
//! # Example
//!
//! ```no_run
//! use scanward::{CommandRunner, Dispatcher, InMemoryStorage, Orchestrator, Registry};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(InMemoryStorage::new());
//! let (handle, _task) =
//!     Orchestrator::with_storage(Arc::clone(&storage), Arc::new(CommandRunner::default()))
//!         .start()
//!         .await;
//!
//! let dispatcher = Dispatcher::new(Registry::new(storage), handle);
//! let id = dispatcher
//!     .start("scanme.nmap.org", vec!["-sT".into(), "--top-ports".into(), "100".into()], None)
//!     .await?;
//! println!("{}: {}", id, dispatcher.poll(&id).await?);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod events;
pub mod execution;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod storage;
pub mod testing;
pub mod validation;

pub use config::{Config, ConfigError, StorageConfig};
pub use core::attempt::{AttemptOutcome, ExecutionAttempt, Failure, FailureKind};
pub use core::retry::RetryPolicy;
pub use core::state::{TaskState, TransitionError};
pub use core::task::ScanTask;
pub use core::types::TaskId;
pub use dispatcher::{DispatchError, Dispatcher};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{
    CommandRunner, CommandRunnerBuilder, Heartbeat, RunOutcome, RunRequest, ScanRunner,
};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle, OrchestratorState};
pub use parser::{ParseError, ScanResult, parse_scan_output};
pub use registry::{Registry, RegistryError, TaskSummary};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, Storage, StorageError, TaskRecord};
pub use validation::{ValidatedInput, ValidationError, Validator};
