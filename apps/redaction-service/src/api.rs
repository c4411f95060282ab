//! HTTP surface for the redaction service
//!
//! - `GET /health`
//! - `POST /api/documents/{*path}`: raw PDF body, `path` is the blob name it
//!   was uploaded under. Responds with the delivery receipt.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::{DeliveryReceipt, InboundDocument, Pipeline};

/// Largest accepted upload (scanned records run to tens of megabytes)
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Bounds how many documents are processed at once
    pub permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, max_concurrent: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/documents/*path", post(handle_redact_document))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Handler: GET /health
pub async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "redaction-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct RedactResponse {
    pub success: bool,
    #[serde(flatten)]
    pub receipt: DeliveryReceipt,
}

/// Handler: POST /api/documents/{*path}
pub async fn handle_redact_document(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<Json<RedactResponse>, PipelineError> {
    if path.trim_matches('/').is_empty() {
        return Err(PipelineError::InvalidRequest("missing blob path".into()));
    }
    if body.is_empty() {
        return Err(PipelineError::InvalidRequest("empty request body".into()));
    }

    let _permit = state
        .permits
        .acquire()
        .await
        .map_err(|_| PipelineError::Internal("service is shutting down".into()))?;
    debug!(
        available = state.permits.available_permits(),
        "Acquired processing slot"
    );

    let receipt = state
        .pipeline
        .run(InboundDocument {
            path,
            bytes: body.to_vec(),
        })
        .await?;

    Ok(Json(RedactResponse {
        success: true,
        receipt,
    }))
}
