//! The immutable description of a requested scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::TaskId;

/// One requested unit of scan work.
///
/// Created once by the dispatcher; every field is fixed from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTask {
    id: TaskId,
    target: String,
    arguments: Vec<String>,
    label: String,
    created_at: DateTime<Utc>,
}

impl ScanTask {
    /// Create a task with a freshly generated identifier.
    ///
    /// An empty label is replaced by `Scan of <target>`.
    pub fn new<I, S>(target: impl Into<String>, arguments: I, label: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_id(TaskId::generate(), target, arguments, label, Utc::now())
    }

    /// Rebuild a task from stored fields.
    pub fn with_id<I, S>(
        id: TaskId,
        target: impl Into<String>,
        arguments: I,
        label: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target = target.into();
        let label = label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| format!("Scan of {}", target));
        Self {
            id,
            target,
            arguments: arguments.into_iter().map(Into::into).collect(),
            label,
            created_at,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// What to scan (host, address or CIDR).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// How to scan, passed verbatim to the command after validation.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
