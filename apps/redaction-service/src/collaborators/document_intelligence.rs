//! Azure AI Document Intelligence (Form Recognizer) layout adapter
//!
//! Submits the PDF to a custom model, polls the operation until it settles
//! and converts the result into the core layout model. The service numbers
//! pages from 1; everything handed to the core is 0-based.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redaction_core::{
    BoundingRegion, Extraction, Field, FieldValue, LayoutPage, LayoutResult, Line, Polygon, Word,
};
use serde::Deserialize;
use tracing::{debug, info};

use super::{trim_endpoint, LayoutExtractor};
use crate::config::FormRecognizerConfig;
use crate::error::PipelineError;

const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

pub struct DocumentIntelligenceClient {
    http: reqwest::Client,
    config: FormRecognizerConfig,
    poll_interval: Duration,
}

impl DocumentIntelligenceClient {
    pub fn new(http: reqwest::Client, config: FormRecognizerConfig, poll_interval: Duration) -> Self {
        Self {
            http,
            config,
            poll_interval,
        }
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/formrecognizer/documentModels/{}:analyze?api-version={}",
            trim_endpoint(&self.config.endpoint),
            self.config.model_id,
            self.config.api_version
        )
    }

    async fn submit(&self, pdf: &[u8]) -> Result<String, PipelineError> {
        let response = self
            .http
            .post(self.analyze_url())
            .header(KEY_HEADER, self.config.key.expose())
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(pdf.to_vec())
            .send()
            .await
            .map_err(|e| PipelineError::Extraction(format!("analyze request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Extraction(format!(
                "analyze request returned {}",
                status
            )));
        }

        response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Extraction("analyze response has no Operation-Location".into())
            })
    }

    async fn poll(&self, operation: &str) -> Result<AnalyzeResult, PipelineError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let response = self
                .http
                .get(operation)
                .header(KEY_HEADER, self.config.key.expose())
                .send()
                .await
                .map_err(|e| PipelineError::Extraction(format!("poll request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(PipelineError::Extraction(format!(
                    "poll request returned {}",
                    status
                )));
            }

            let body: AnalyzeOperation = response.json().await.map_err(|e| {
                PipelineError::Extraction(format!("unreadable analyze operation: {}", e))
            })?;

            match body.status.as_str() {
                "succeeded" => {
                    debug!(attempts, "Layout analysis finished");
                    return body.analyze_result.ok_or_else(|| {
                        PipelineError::Extraction("succeeded without analyzeResult".into())
                    });
                }
                "failed" | "canceled" => {
                    let detail = body
                        .error
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| body.status.clone());
                    return Err(PipelineError::Extraction(format!(
                        "analysis {}",
                        detail
                    )));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl LayoutExtractor for DocumentIntelligenceClient {
    async fn analyze(&self, pdf: &[u8]) -> Result<Extraction, PipelineError> {
        info!(model = %self.config.model_id, bytes = pdf.len(), "Submitting layout analysis");
        let operation = self.submit(pdf).await?;
        let result = self.poll(&operation).await?;
        Ok(into_extraction(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOperation {
    status: String,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AnalyzeResult {
    #[serde(default)]
    content: String,
    #[serde(default)]
    pages: Vec<PageDto>,
    #[serde(default)]
    documents: Vec<DocumentDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageDto {
    page_number: Option<usize>,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
    #[serde(default)]
    lines: Vec<TextDto>,
    #[serde(default)]
    words: Vec<TextDto>,
}

#[derive(Debug, Deserialize)]
struct TextDto {
    #[serde(default)]
    content: String,
    #[serde(default)]
    polygon: Option<Polygon>,
}

#[derive(Debug, Deserialize)]
struct DocumentDto {
    #[serde(default)]
    fields: BTreeMap<String, FieldDto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldDto {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    bounding_regions: Vec<RegionDto>,
    #[serde(default)]
    value_object: Option<BTreeMap<String, FieldDto>>,
    #[serde(default)]
    value_array: Option<Vec<FieldDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionDto {
    page_number: usize,
    #[serde(default)]
    polygon: Option<Polygon>,
}

pub(crate) fn into_extraction(result: AnalyzeResult) -> Extraction {
    let pages = result
        .pages
        .into_iter()
        .enumerate()
        .map(|(index, page)| LayoutPage {
            number: page
                .page_number
                .map(|n| n.saturating_sub(1))
                .unwrap_or(index),
            width: page.width,
            height: page.height,
            lines: page
                .lines
                .into_iter()
                .map(|l| Line {
                    content: l.content,
                    polygon: l.polygon,
                })
                .collect(),
            words: page
                .words
                .into_iter()
                .map(|w| Word {
                    content: w.content,
                    polygon: w.polygon,
                })
                .collect(),
        })
        .collect();

    let mut fields = Vec::new();
    for document in result.documents {
        for (key, field) in document.fields {
            flatten_field(key, field, &mut fields);
        }
    }

    Extraction {
        layout: LayoutResult {
            content: result.content,
            pages,
        },
        fields,
    }
}

/// Object and array fields contribute their leaves, keyed by path.
fn flatten_field(key: String, field: FieldDto, out: &mut Vec<Field>) {
    let FieldDto {
        content,
        bounding_regions,
        value_object,
        value_array,
    } = field;

    let mut children = Vec::new();
    if let Some(object) = value_object {
        children.extend(
            object
                .into_iter()
                .map(|(child, value)| (format!("{}.{}", key, child), value)),
        );
    }
    if let Some(array) = value_array {
        children.extend(
            array
                .into_iter()
                .enumerate()
                .map(|(i, value)| (format!("{}[{}]", key, i), value)),
        );
    }

    if children.is_empty() {
        out.push(Field {
            key,
            value: FieldValue {
                content,
                bounding_regions: bounding_regions
                    .into_iter()
                    .map(|r| BoundingRegion {
                        page_number: r.page_number.saturating_sub(1),
                        polygon: r.polygon,
                    })
                    .collect(),
            },
        });
        return;
    }

    for (child_key, child) in children {
        flatten_field(child_key, child, out);
    }
}
