//! Core identifier types for the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix for every generated task identifier.
const TASK_ID_PREFIX: &str = "scan-";

/// Number of hex characters taken from the UUID.
const TASK_ID_HEX_LEN: usize = 12;

/// Unique identifier for a scan task.
///
/// Generated once at start time and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap an existing identifier (e.g. one read back from storage or a request path).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier of the form `scan-<12 hex chars>`.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("{}{}", TASK_ID_PREFIX, &hex[..TASK_ID_HEX_LEN]))
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
