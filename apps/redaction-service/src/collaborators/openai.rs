//! Azure OpenAI chat-completions PII detector

use std::collections::HashSet;

use async_trait::async_trait;
use lazy_static::lazy_static;
use redaction_core::PiiEntity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::PiiDetector;
use crate::config::OpenAiConfig;
use crate::error::PipelineError;

const TEMPERATURE: f64 = 0.7;
const TOP_P: f64 = 0.95;
const MAX_TOKENS: u32 = 800;

const INSTRUCTIONS: &str = "You are an AI assistant that finds personally identifiable information. \
List every person name that appears in the document below except the name of the deceased. \
Answer with a plain JSON array of the names exactly as they are written in the document, \
without markdown or commentary.";

lazy_static! {
    /// Markdown code fence, with or without a language
    static ref CODE_FENCE: Regex = Regex::new(r"```[A-Za-z]*").unwrap();
    /// Language tag left at the front once the fence is gone
    static ref LANGUAGE_TAG: Regex = Regex::new(r"(?i)^json\b").unwrap();
}

pub struct OpenAiDetector {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiDetector {
    pub fn new(http: reqwest::Client, config: OpenAiConfig) -> Self {
        Self { http, config }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Prompt with the document text and, when available, recognizer hints.
fn build_prompt(text: &str, entities: &[PiiEntity]) -> String {
    let mut prompt = String::from(INSTRUCTIONS);
    if !entities.is_empty() {
        prompt.push_str("\n\nEntities already recognized in the document:\n");
        for entity in entities {
            prompt.push_str(&format!("- {} ({})\n", entity.text, entity.category));
        }
    }
    prompt.push_str("\n\nDocument:\n");
    prompt.push_str(text);
    prompt
}

#[async_trait]
impl PiiDetector for OpenAiDetector {
    async fn detect(
        &self,
        text: &str,
        entities: &[PiiEntity],
    ) -> Result<Vec<String>, PipelineError> {
        let request = ChatRequest {
            messages: vec![ChatMessage {
                role: "system",
                content: build_prompt(text, entities),
            }],
            temperature: TEMPERATURE,
            top_p: TOP_P,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .http
            .post(&self.config.endpoint)
            .header("api-key", self.config.key.expose())
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Detection(format!("completion request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Detection(format!(
                "completion request returned {}",
                status
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Detection(format!("unreadable completion: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::DetectionParse("completion has no content".into()))?;

        let values = parse_pii_response(&content)?;
        debug!(values = values.len(), "Detector returned PII values");
        Ok(values)
    }
}

/// Turn a completion into a list of PII strings.
///
/// Markdown fences and a leading `json` tag are stripped. Accepts a bare array
/// of strings or an object whose only field is such an array. Values are
/// trimmed, blanks dropped and duplicates removed in first-seen order.
pub fn parse_pii_response(content: &str) -> Result<Vec<String>, PipelineError> {
    let unfenced = CODE_FENCE.replace_all(content, "");
    let cleaned = LANGUAGE_TAG.replace(unfenced.trim(), "");

    let value: Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| PipelineError::DetectionParse(format!("not JSON: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
            Some((_, Value::Array(items))) => items,
            _ => {
                return Err(PipelineError::DetectionParse(
                    "object field is not an array".into(),
                ))
            }
        },
        Value::Object(_) => {
            return Err(PipelineError::DetectionParse(
                "expected an object with exactly one field".into(),
            ))
        }
        _ => {
            return Err(PipelineError::DetectionParse(
                "expected a JSON array".into(),
            ))
        }
    };

    let mut seen = HashSet::new();
    let mut values = Vec::new();
    for item in items {
        let Value::String(text) = item else {
            return Err(PipelineError::DetectionParse(
                "array contains a non-string value".into(),
            ));
        };
        let text = text.trim();
        if !text.is_empty() && seen.insert(text.to_string()) {
            values.push(text.to_string());
        }
    }
    Ok(values)
}
