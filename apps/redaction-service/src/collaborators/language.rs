//! Azure AI Language PII entity recognition

use async_trait::async_trait;
use redaction_core::PiiEntity;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{trim_endpoint, EntityRecognizer};
use crate::config::LanguageConfig;
use crate::error::PipelineError;

const API_VERSION: &str = "2023-04-01";

/// Service limit on characters per document
pub const MAX_CHUNK_CHARS: usize = 5000;

/// Service limit on documents per synchronous request
pub const MAX_DOCUMENTS_PER_REQUEST: usize = 5;

pub struct LanguageClient {
    http: reqwest::Client,
    config: LanguageConfig,
}

impl LanguageClient {
    pub fn new(http: reqwest::Client, config: LanguageConfig) -> Self {
        Self { http, config }
    }

    fn url(&self) -> String {
        format!(
            "{}/language/:analyze-text?api-version={}",
            trim_endpoint(&self.config.endpoint),
            API_VERSION
        )
    }

    async fn recognize_batch(
        &self,
        documents: Vec<InputDocument<'_>>,
    ) -> Result<Vec<PiiEntity>, PipelineError> {
        let request = AnalyzeRequest {
            kind: "PiiEntityRecognition",
            parameters: Parameters {
                model_version: "latest",
            },
            analysis_input: AnalysisInput { documents },
        };

        let response = self
            .http
            .post(self.url())
            .header("Ocp-Apim-Subscription-Key", self.config.key.expose())
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Detection(format!("entity request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Detection(format!(
                "entity request returned {}",
                status
            )));
        }

        let body: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Detection(format!("unreadable entity response: {}", e)))?;

        if let Some(error) = body.results.errors.first() {
            return Err(PipelineError::Detection(format!(
                "entity recognition failed for chunk {}: {}",
                error.id, error.error.code
            )));
        }

        Ok(body
            .results
            .documents
            .into_iter()
            .flat_map(|d| d.entities)
            .map(|e| PiiEntity {
                text: e.text,
                category: e.category,
                confidence: e.confidence_score,
            })
            .collect())
    }
}

#[async_trait]
impl EntityRecognizer for LanguageClient {
    async fn recognize(&self, text: &str) -> Result<Vec<PiiEntity>, PipelineError> {
        let chunks = chunk_text(text, MAX_CHUNK_CHARS);
        let mut entities = Vec::new();

        for (batch_index, batch) in chunks.chunks(MAX_DOCUMENTS_PER_REQUEST).enumerate() {
            let documents = batch
                .iter()
                .enumerate()
                .map(|(i, chunk)| InputDocument {
                    id: (batch_index * MAX_DOCUMENTS_PER_REQUEST + i + 1).to_string(),
                    language: "en",
                    text: *chunk,
                })
                .collect();
            entities.extend(self.recognize_batch(documents).await?);
        }

        debug!(
            chunks = chunks.len(),
            entities = entities.len(),
            "Entity recognition finished"
        );
        Ok(entities)
    }
}

/// Split text into pieces of at most `max_chars` characters.
///
/// Breaks after the last whitespace inside the window when there is one, so
/// words are not cut in half. Concatenating the chunks gives back the input.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    let max_chars = max_chars.max(1);

    while !rest.is_empty() {
        let window_end = match rest.char_indices().nth(max_chars) {
            Some((index, _)) => index,
            None => {
                chunks.push(rest);
                break;
            }
        };

        let split = rest[..window_end]
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .last()
            .map(|(index, c)| index + c.len_utf8())
            .unwrap_or(window_end);

        let (chunk, tail) = rest.split_at(split);
        chunks.push(chunk);
        rest = tail;
    }

    chunks
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    kind: &'static str,
    parameters: Parameters,
    analysis_input: AnalysisInput<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Parameters {
    model_version: &'static str,
}

#[derive(Serialize)]
struct AnalysisInput<'a> {
    documents: Vec<InputDocument<'a>>,
}

#[derive(Serialize)]
struct InputDocument<'a> {
    id: String,
    language: &'static str,
    text: &'a str,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    results: AnalyzeResults,
}

#[derive(Deserialize)]
struct AnalyzeResults {
    #[serde(default)]
    documents: Vec<DocumentResult>,
    #[serde(default)]
    errors: Vec<DocumentError>,
}

#[derive(Deserialize)]
struct DocumentResult {
    #[serde(default)]
    entities: Vec<EntityDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityDto {
    text: String,
    category: String,
    #[serde(default)]
    confidence_score: f64,
}

#[derive(Deserialize)]
struct DocumentError {
    id: String,
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
}
