//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::attempt::{AttemptOutcome, ExecutionAttempt, Failure};
use crate::parser::ScanResult;
use crate::registry::TaskSummary;
use crate::storage::TaskRecord;

/// Scan arguments as sent by callers.
///
/// Either a JSON list of tokens or a single command-line string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScanArguments {
    List(Vec<String>),
    Line(String),
}

impl ScanArguments {
    /// Split into argument tokens.
    ///
    /// A line that cannot be split (unbalanced quotes, trailing escape)
    /// is kept as one token so validation rejects it.
    pub fn into_tokens(self) -> Vec<String> {
        match self {
            ScanArguments::List(tokens) => tokens,
            ScanArguments::Line(line) => shlex::split(&line).unwrap_or_else(|| vec![line]),
        }
    }
}

/// Body of a start or run request.
#[derive(Debug, Deserialize)]
pub struct StartScanRequest {
    pub target: String,
    #[serde(default, alias = "nmap_args")]
    pub arguments: Option<ScanArguments>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Start response.
#[derive(Debug, Serialize)]
pub struct StartScanResponse {
    pub scan_id: String,
    pub status: String,
    pub message: String,
}

/// Scan summary for list responses.
#[derive(Debug, Serialize)]
pub struct ScanSummaryResponse {
    pub scan_id: String,
    pub status: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl From<TaskSummary> for ScanSummaryResponse {
    fn from(summary: TaskSummary) -> Self {
        Self {
            scan_id: summary.id.to_string(),
            status: summary.state.to_string(),
            label: summary.label,
            created_at: summary.created_at,
        }
    }
}

/// List of scans response.
#[derive(Debug, Serialize)]
pub struct ScanListResponse {
    pub scans: Vec<ScanSummaryResponse>,
    pub count: usize,
}

/// One execution attempt in a status response.
#[derive(Debug, Serialize)]
pub struct AttemptResponse {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

impl From<&ExecutionAttempt> for AttemptResponse {
    fn from(attempt: &ExecutionAttempt) -> Self {
        Self {
            number: attempt.number,
            started_at: attempt.started_at,
            last_heartbeat: attempt.heartbeats.last().copied(),
            finished_at: attempt.finished_at,
            outcome: attempt.outcome.as_ref().map(outcome_to_string),
        }
    }
}

fn outcome_to_string(outcome: &AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Succeeded => "succeeded".to_string(),
        AttemptOutcome::TimedOut { reason } => format!("timed out: {}", reason),
        AttemptOutcome::Crashed { reason } => format!("crashed: {}", reason),
        AttemptOutcome::ProcessError { exit_code, .. } => match exit_code {
            Some(code) => format!("process error: exit code {}", code),
            None => "process error".to_string(),
        },
    }
}

/// Failure details.
#[derive(Debug, Serialize)]
pub struct FailureResponse {
    pub kind: String,
    pub message: String,
    pub diagnostics: Option<String>,
}

impl From<&Failure> for FailureResponse {
    fn from(failure: &Failure) -> Self {
        Self {
            kind: failure.kind.to_string(),
            message: failure.message.clone(),
            diagnostics: failure.diagnostics.clone(),
        }
    }
}

/// Scan status response.
#[derive(Debug, Serialize)]
pub struct ScanStatusResponse {
    pub scan_id: String,
    pub status: String,
    pub label: String,
    pub target: String,
    pub arguments: Vec<String>,
    pub attempts: Vec<AttemptResponse>,
    pub failure: Option<FailureResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for ScanStatusResponse {
    fn from(record: &TaskRecord) -> Self {
        let task = record.task();
        Self {
            scan_id: record.id().to_string(),
            status: record.state().to_string(),
            label: task.label().to_string(),
            target: task.target().to_string(),
            arguments: task.arguments().to_vec(),
            attempts: record.attempts().iter().map(AttemptResponse::from).collect(),
            failure: record.failure().map(FailureResponse::from),
            created_at: task.created_at(),
            updated_at: record.updated_at(),
        }
    }
}

/// Result of a completed scan.
#[derive(Debug, Serialize)]
pub struct ScanResultResponse {
    pub scan_id: String,
    pub summary: String,
    pub result: ScanResult,
}

/// Final state of a run-and-wait request.
#[derive(Debug, Serialize)]
pub struct RunScanResponse {
    pub scan_id: String,
    pub status: String,
    pub result: Option<ScanResult>,
    pub failure: Option<FailureResponse>,
}

impl From<TaskRecord> for RunScanResponse {
    fn from(record: TaskRecord) -> Self {
        Self {
            scan_id: record.id().to_string(),
            status: record.state().to_string(),
            result: record.result().cloned(),
            failure: record.failure().map(FailureResponse::from),
        }
    }
}

/// Cancel response.
#[derive(Debug, Serialize)]
pub struct CancelScanResponse {
    pub scan_id: String,
    pub status: String,
    pub message: String,
}
