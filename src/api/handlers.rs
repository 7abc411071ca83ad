//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::core::state::TaskState;
use crate::core::types::TaskId;
use crate::dispatcher::Dispatcher;
use crate::storage::Storage;

use super::errors::ApiError;
use super::responses::{
    CancelScanResponse, HealthResponse, RunScanResponse, ScanListResponse, ScanResultResponse,
    ScanStatusResponse, ScanSummaryResponse, StartScanRequest, StartScanResponse,
};

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub dispatcher: Dispatcher<S>,
    /// Arguments used when a request carries none.
    pub default_arguments: Arc<Vec<String>>,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            default_arguments: Arc::clone(&self.default_arguments),
        }
    }
}

impl<S: Storage> ApiState<S> {
    fn arguments_for(&self, request: &mut StartScanRequest) -> Vec<String> {
        match request.arguments.take() {
            Some(arguments) => arguments.into_tokens(),
            None => self.default_arguments.as_ref().clone(),
        }
    }
}

/// Query parameters for the list endpoint.
#[derive(Debug, Deserialize)]
pub struct ListScansQuery {
    /// Only scans in this state, e.g. `RUNNING`.
    pub status: Option<TaskState>,
    pub limit: Option<usize>,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// List scans, oldest first.
pub async fn list_scans<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListScansQuery>,
) -> Result<Json<ScanListResponse>, ApiError> {
    let scans: Vec<ScanSummaryResponse> = state
        .dispatcher
        .list()
        .await?
        .into_iter()
        .filter(|s| query.status.is_none_or(|wanted| s.state == wanted))
        .take(query.limit.unwrap_or(usize::MAX))
        .map(ScanSummaryResponse::from)
        .collect();
    let count = scans.len();
    Ok(Json(ScanListResponse { scans, count }))
}

/// Start a scan and return its id immediately.
pub async fn start_scan<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(mut request): Json<StartScanRequest>,
) -> Result<(StatusCode, Json<StartScanResponse>), ApiError> {
    let arguments = state.arguments_for(&mut request);
    let target = request.target;
    let id = state
        .dispatcher
        .start(target.clone(), arguments, request.label)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartScanResponse {
            scan_id: id.to_string(),
            status: TaskState::Queued.to_string(),
            message: format!(
                "scan of {} started; poll /api/scans/{} for progress",
                target, id
            ),
        }),
    ))
}

/// Start a scan and wait for it to finish.
pub async fn run_scan<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(mut request): Json<StartScanRequest>,
) -> Result<Json<RunScanResponse>, ApiError> {
    let arguments = state.arguments_for(&mut request);
    let record = state
        .dispatcher
        .run_and_wait(request.target, arguments, request.label)
        .await?;
    Ok(Json(RunScanResponse::from(record)))
}

/// Get a scan's status, attempts and failure.
pub async fn get_scan<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(scan_id): Path<String>,
) -> Result<Json<ScanStatusResponse>, ApiError> {
    let record = state.dispatcher.describe(&TaskId::new(scan_id)).await?;
    Ok(Json(ScanStatusResponse::from(&record)))
}

/// Get the result of a completed scan.
pub async fn get_scan_result<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(scan_id): Path<String>,
) -> Result<Json<ScanResultResponse>, ApiError> {
    let id = TaskId::new(scan_id);
    let result = state.dispatcher.fetch(&id).await?;
    Ok(Json(ScanResultResponse {
        scan_id: id.to_string(),
        summary: result.summary.clone(),
        result,
    }))
}

/// Cancel a scan.
pub async fn cancel_scan<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(scan_id): Path<String>,
) -> Result<Json<CancelScanResponse>, ApiError> {
    let id = TaskId::new(scan_id);
    let final_state = state.dispatcher.cancel(&id).await?;
    let message = if final_state == TaskState::Cancelled {
        format!("scan '{}' cancelled", id)
    } else {
        format!("scan '{}' already finished", id)
    };
    Ok(Json(CancelScanResponse {
        scan_id: id.to_string(),
        status: final_state.to_string(),
        message,
    }))
}
