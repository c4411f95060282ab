//! External services the pipeline depends on
//!
//! Each capability is a trait so the pipeline can run against the Azure
//! adapters in production and in-memory fakes in tests.

use async_trait::async_trait;
use redaction_core::{Extraction, PiiEntity};

use crate::error::PipelineError;

pub mod blob;
pub mod document_intelligence;
pub mod language;
pub mod openai;

pub use blob::{AzureBlobStore, LocalBlobStore, StorageAccount};
pub use document_intelligence::DocumentIntelligenceClient;
pub use language::LanguageClient;
pub use openai::{parse_pii_response, OpenAiDetector};

/// OCR and layout analysis of a scanned document.
#[async_trait]
pub trait LayoutExtractor: Send + Sync {
    /// Fails with `PipelineError::Extraction`.
    async fn analyze(&self, pdf: &[u8]) -> Result<Extraction, PipelineError>;
}

/// Decides which strings in the document text are PII.
#[async_trait]
pub trait PiiDetector: Send + Sync {
    /// `entities` come from the optional recognizer pass and are offered to
    /// the detector as context. Fails with `Detection` or `DetectionParse`.
    async fn detect(&self, text: &str, entities: &[PiiEntity])
        -> Result<Vec<String>, PipelineError>;
}

/// Named-entity recognition over the document text.
#[async_trait]
pub trait EntityRecognizer: Send + Sync {
    async fn recognize(&self, text: &str) -> Result<Vec<PiiEntity>, PipelineError>;
}

/// Destination for redacted documents. Existing blobs are overwritten.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, container: &str, name: &str, bytes: Vec<u8>)
        -> Result<(), PipelineError>;
}

/// Shared HTTP client with the configured request timeout.
pub fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Drop any trailing slash so paths can be appended with `format!`.
pub(crate) fn trim_endpoint(endpoint: &str) -> &str {
    endpoint.trim_end_matches('/')
}
