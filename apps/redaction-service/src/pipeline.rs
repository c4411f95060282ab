//! Per-document orchestration
//!
//! `Received → Extracted → Detected → Matched → Redacted → Serialized →
//! Delivered`, or `Failed` from any stage. A failed or timed-out document
//! delivers nothing. Log lines carry stage names and counts, never the
//! detected values or document text.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use redaction_core::{
    find_redaction_targets, redact_pages, MatchPolicy, RedactionDocument, RedactionReport,
};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::collaborators::{
    http_client, AzureBlobStore, BlobStore, DocumentIntelligenceClient, EntityRecognizer,
    LanguageClient, LayoutExtractor, OpenAiDetector, PiiDetector,
};
use crate::config::Config;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Extracted,
    Detected,
    Matched,
    Redacted,
    Serialized,
    Delivered,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Extracted => "extracted",
            Stage::Detected => "detected",
            Stage::Matched => "matched",
            Stage::Redacted => "redacted",
            Stage::Serialized => "serialized",
            Stage::Delivered => "delivered",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A PDF as it arrived, with the blob path it was uploaded under.
#[derive(Debug, Clone)]
pub struct InboundDocument {
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub id: Uuid,
    pub container: String,
    pub blob_name: String,
    pub page_count: usize,
    pub redacted: usize,
    pub skipped: usize,
    pub overlays_painted: usize,
    pub report: RedactionReport,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub inbound_container: String,
    pub outbound_container: String,
    pub document_timeout: Duration,
    pub match_policy: MatchPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inbound_container: config.inbound_container.clone(),
            outbound_container: config.outbound_container.clone(),
            document_timeout: config.document_timeout,
            match_policy: config.match_policy,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            inbound_container: "inbound".to_string(),
            outbound_container: "outbound".to_string(),
            document_timeout: Duration::from_secs(300),
            match_policy: MatchPolicy::default(),
        }
    }
}

/// Output blob name for an inbound path.
///
/// `inbound/records/smith.pdf` becomes `records/smith-redacted.pdf`. Only a
/// leading container segment and a trailing `.pdf` (any case) are removed.
pub fn output_name(path: &str, inbound_container: &str) -> String {
    let path = path.trim_start_matches('/');
    let path = path
        .strip_prefix(inbound_container)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path);

    let stem = match path.len().checked_sub(4) {
        Some(cut) if path.is_char_boundary(cut) && path[cut..].eq_ignore_ascii_case(".pdf") => {
            &path[..cut]
        }
        _ => path,
    };
    format!("{}-redacted.pdf", stem)
}

pub struct Pipeline {
    extractor: Arc<dyn LayoutExtractor>,
    detector: Arc<dyn PiiDetector>,
    recognizer: Option<Arc<dyn EntityRecognizer>>,
    store: Arc<dyn BlobStore>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        extractor: Arc<dyn LayoutExtractor>,
        detector: Arc<dyn PiiDetector>,
        store: Arc<dyn BlobStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            extractor,
            detector,
            recognizer: None,
            store,
            settings,
        }
    }

    /// Run entity recognition before detection and pass its findings along.
    pub fn with_recognizer(mut self, recognizer: Arc<dyn EntityRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Replace the delivery target, e.g. with a local directory.
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = store;
        self
    }

    /// Wire up the Azure adapters described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let http = http_client(config.http_timeout)?;

        let extractor = DocumentIntelligenceClient::new(
            http.clone(),
            config.form_recognizer.clone(),
            config.poll_interval,
        );
        let detector = OpenAiDetector::new(http.clone(), config.openai.clone());
        let store = AzureBlobStore::new(http.clone(), config.storage.clone());

        let mut pipeline = Self::new(
            Arc::new(extractor),
            Arc::new(detector),
            Arc::new(store),
            PipelineSettings::from_config(config),
        );
        if let Some(language) = &config.language {
            pipeline = pipeline.with_recognizer(Arc::new(LanguageClient::new(
                http,
                language.clone(),
            )));
        }
        Ok(pipeline)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Process one document end to end under the document timeout.
    pub async fn run(&self, document: InboundDocument) -> Result<DeliveryReceipt, PipelineError> {
        let id = Uuid::new_v4();
        let span = info_span!("document", id = %id, blob = %document.path);

        async move {
            let timeout = self.settings.document_timeout;
            let mut stage = Stage::Received;

            let result =
                match tokio::time::timeout(timeout, self.process(id, document, &mut stage)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout(timeout.as_secs())),
                };

            match &result {
                Ok(receipt) => info!(
                    stage = %Stage::Delivered,
                    redacted = receipt.redacted,
                    skipped = receipt.skipped,
                    "Document delivered"
                ),
                Err(e) => error!(
                    stage = %Stage::Failed,
                    failed_after = %stage,
                    kind = e.kind(),
                    error = %e,
                    "Document aborted"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        id: Uuid,
        document: InboundDocument,
        stage: &mut Stage,
    ) -> Result<DeliveryReceipt, PipelineError> {
        let InboundDocument { path, bytes } = document;
        info!(stage = %stage, bytes = bytes.len(), "Document received");

        let blob_name = output_name(&path, &self.settings.inbound_container);

        let extraction = self.extractor.analyze(&bytes).await?;
        extraction
            .layout
            .validate()
            .map_err(|e| PipelineError::Extraction(format!("inconsistent layout: {}", e)))?;
        *stage = Stage::Extracted;
        info!(
            stage = %stage,
            pages = extraction.layout.pages.len(),
            fields = extraction.fields.len(),
            "Layout extracted"
        );

        let text = &extraction.layout.content;
        let entities = match &self.recognizer {
            Some(recognizer) => recognizer.recognize(text).await?,
            None => Vec::new(),
        };
        let values = self.detector.detect(text, &entities).await?;
        *stage = Stage::Detected;
        info!(
            stage = %stage,
            entities = entities.len(),
            values = values.len(),
            "PII detected"
        );

        let matches = find_redaction_targets(
            &extraction.layout,
            &extraction.fields,
            &values,
            &self.settings.match_policy,
        );
        *stage = Stage::Matched;
        info!(
            stage = %stage,
            targets = matches.targets.len(),
            skipped = matches.skipped.len(),
            "Targets matched"
        );

        let layout = extraction.layout;
        let (doc, report) = tokio::task::spawn_blocking(move || {
            let mut doc = RedactionDocument::open(&bytes)?;
            let report = redact_pages(&mut doc, &layout, &matches);
            Ok::<_, redaction_core::RedactError>((doc, report))
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("redaction task failed: {}", e)))??;
        *stage = Stage::Redacted;
        info!(
            stage = %stage,
            redacted = report.redacted(),
            skipped = report.skipped(),
            overlays = report.overlays_painted(),
            "Redactions applied"
        );

        let output = tokio::task::spawn_blocking(move || doc.save())
            .await
            .map_err(|e| PipelineError::Internal(format!("serialization task failed: {}", e)))??;
        *stage = Stage::Serialized;
        info!(stage = %stage, bytes = output.len(), "Document serialized");

        self.store
            .put(&self.settings.outbound_container, &blob_name, output)
            .await?;

        Ok(DeliveryReceipt {
            id,
            container: self.settings.outbound_container.clone(),
            blob_name,
            page_count: report.page_count,
            redacted: report.redacted(),
            skipped: report.skipped(),
            overlays_painted: report.overlays_painted(),
            report,
        })
    }
}
