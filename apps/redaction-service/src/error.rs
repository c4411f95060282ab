//! Error types for the redaction service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use redaction_core::RedactError;
use serde::Serialize;
use thiserror::Error;

/// Errors that abort a whole document.
///
/// Messages describe the failing stage and never include document text or
/// detected values.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Layout extraction failed: {0}")]
    Extraction(String),

    #[error("PII detection failed: {0}")]
    Detection(String),

    #[error("PII detection returned an unusable response: {0}")]
    DetectionParse(String),

    #[error("Failed to open document: {0}")]
    DocumentOpen(String),

    #[error("Failed to serialize redacted document: {0}")]
    Serialization(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Document timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Extraction(_) => "extraction",
            PipelineError::Detection(_) => "detection",
            PipelineError::DetectionParse(_) => "detection_parse",
            PipelineError::DocumentOpen(_) => "document_open",
            PipelineError::Serialization(_) => "serialization",
            PipelineError::Delivery(_) => "delivery",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::Internal(_) => "internal",
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            PipelineError::Extraction(_) => (StatusCode::BAD_GATEWAY, "EXTRACTION_ERROR"),
            PipelineError::Detection(_) => (StatusCode::BAD_GATEWAY, "DETECTION_ERROR"),
            PipelineError::DetectionParse(_) => {
                (StatusCode::BAD_GATEWAY, "DETECTION_PARSE_ERROR")
            }
            PipelineError::DocumentOpen(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "DOCUMENT_OPEN_ERROR")
            }
            PipelineError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR")
            }
            PipelineError::Delivery(_) => (StatusCode::BAD_GATEWAY, "DELIVERY_ERROR"),
            PipelineError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            PipelineError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            PipelineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<RedactError> for PipelineError {
    fn from(err: RedactError) -> Self {
        match err {
            RedactError::DocumentOpen(msg) => PipelineError::DocumentOpen(msg),
            RedactError::Serialization(msg) => PipelineError::Serialization(msg),
            // Per-fragment errors are folded into the report before they get here
            other => PipelineError::Internal(other.to_string()),
        }
    }
}
