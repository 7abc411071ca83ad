//! API error types and HTTP status mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::dispatcher::DispatchError;
use crate::orchestrator::OrchestratorError;
use crate::registry::RegistryError;
use crate::storage::StorageError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Request conflicts with the scan's state (e.g. no result yet).
    Conflict(String),
    /// Service unavailable (e.g. orchestrator shutting down).
    ServiceUnavailable(String),
    /// The scan did not finish within the wait ceiling.
    WaitTimeout(String),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg)
            }
            ApiError::WaitTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "WAIT_TIMEOUT", msg),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Registry(e) => e.into(),
            DispatchError::Orchestrator(e) => e.into(),
            timeout @ DispatchError::WaitTimeout { .. } => ApiError::WaitTimeout(timeout.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ApiError::NotFound(format!("scan not found: {}", id)),
            unavailable @ RegistryError::NotAvailable { .. } => {
                ApiError::Conflict(unavailable.to_string())
            }
            RegistryError::Storage(e) => e.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::TaskNotFound(id) => {
                ApiError::NotFound(format!("scan not found: {}", id))
            }
            OrchestratorError::ShuttingDown => {
                ApiError::ServiceUnavailable("orchestrator is shutting down".to_string())
            }
            contended @ OrchestratorError::Contended(_) => ApiError::Conflict(contended.to_string()),
            OrchestratorError::Storage(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => ApiError::NotFound(msg),
            StorageError::DuplicateKey(msg) => ApiError::Conflict(msg),
            e if e.is_transient() => ApiError::ServiceUnavailable(e.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
