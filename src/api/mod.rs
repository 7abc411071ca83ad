//! HTTP API module for scanward.
//!
//! Provides REST endpoints for starting scans, polling their status,
//! fetching results and cancelling them.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{ApiState, ListScansQuery};
pub use responses::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dispatcher::Dispatcher;
use crate::storage::Storage;

/// Default port for the API server.
pub const DEFAULT_PORT: u16 = 8566;

/// Configuration for the API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ApiConfig {
    /// Create a new API config with custom host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Build the API router with all endpoints.
pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Scans
        .route(
            "/api/scans",
            get(handlers::list_scans::<S>).post(handlers::start_scan::<S>),
        )
        .route("/api/scans/run", post(handlers::run_scan::<S>))
        .route("/api/scans/{scan_id}", get(handlers::get_scan::<S>))
        .route(
            "/api/scans/{scan_id}/result",
            get(handlers::get_scan_result::<S>),
        )
        .route(
            "/api/scans/{scan_id}/cancel",
            post(handlers::cancel_scan::<S>),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from a dispatcher.
pub fn create_api_state<S: Storage>(
    dispatcher: Dispatcher<S>,
    default_arguments: Vec<String>,
) -> ApiState<S> {
    ApiState {
        dispatcher,
        default_arguments: Arc::new(default_arguments),
    }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: Storage + 'static>(
    config: ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
