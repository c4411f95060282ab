//! Service configuration
//!
//! Built once at startup from the environment (a `.env` file is honoured).
//! Every missing required key is reported in a single error.
//!
//! Required:
//! - FORM_RECOGNIZER_ENDPOINT, FORM_RECOGNIZER_KEY, FORM_RECOGNIZER_MODEL_ID
//! - OPENAI_ENDPOINT, OPENAI_KEY
//! - STORAGE_CONNECTION_STRING
//!
//! Optional:
//! - LANGUAGE_ENDPOINT / LANGUAGE_KEY (both or neither)
//! - FORM_RECOGNIZER_API_VERSION (default: 2023-07-31)
//! - INBOUND_CONTAINER (inbound), OUTBOUND_CONTAINER (outbound)
//! - REDACT_HTTP_TIMEOUT_SECS (60), REDACT_DOCUMENT_TIMEOUT_SECS (300)
//! - REDACT_POLL_INTERVAL_MS (1000)
//! - REDACT_MATCH_FIELDS (true), REDACT_MATCH_LINES (false), REDACT_MATCH_WORDS (true)
//! - REDACT_MAX_CONCURRENT (4)

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use redaction_core::MatchPolicy;
use thiserror::Error;

use crate::collaborators::StorageAccount;

pub const DEFAULT_FORM_RECOGNIZER_API_VERSION: &str = "2023-07-31";

const REQUIRED_KEYS: [&str; 6] = [
    "FORM_RECOGNIZER_ENDPOINT",
    "FORM_RECOGNIZER_KEY",
    "FORM_RECOGNIZER_MODEL_ID",
    "OPENAI_ENDPOINT",
    "OPENAI_KEY",
    "STORAGE_CONNECTION_STRING",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("LANGUAGE_ENDPOINT and LANGUAGE_KEY must be set together")]
    PartialLanguage,
}

/// Credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct FormRecognizerConfig {
    pub endpoint: String,
    pub key: Secret,
    pub model_id: String,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Full chat-completions URL of the deployment
    pub endpoint: String,
    pub key: Secret,
}

#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub endpoint: String,
    pub key: Secret,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub form_recognizer: FormRecognizerConfig,
    pub openai: OpenAiConfig,
    pub language: Option<LanguageConfig>,
    pub storage: StorageAccount,
    pub inbound_container: String,
    pub outbound_container: String,
    pub http_timeout: Duration,
    pub document_timeout: Duration,
    pub poll_interval: Duration,
    pub match_policy: MatchPolicy,
    pub max_concurrent: usize,
}

impl Config {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<&'static str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &'static str| get(key).unwrap_or_default();

        let language = match (get("LANGUAGE_ENDPOINT"), get("LANGUAGE_KEY")) {
            (Some(endpoint), Some(key)) => Some(LanguageConfig {
                endpoint,
                key: Secret::new(key),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialLanguage),
        };

        let match_policy = MatchPolicy {
            redact_fields: parse_or(&get, "REDACT_MATCH_FIELDS", true, parse_bool)?,
            match_lines: parse_or(&get, "REDACT_MATCH_LINES", false, parse_bool)?,
            match_words: parse_or(&get, "REDACT_MATCH_WORDS", true, parse_bool)?,
        };

        let max_concurrent: usize =
            parse_or(&get, "REDACT_MAX_CONCURRENT", 4, parse_number)?;
        if max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "REDACT_MAX_CONCURRENT",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            form_recognizer: FormRecognizerConfig {
                endpoint: required("FORM_RECOGNIZER_ENDPOINT"),
                key: Secret::new(required("FORM_RECOGNIZER_KEY")),
                model_id: required("FORM_RECOGNIZER_MODEL_ID"),
                api_version: get("FORM_RECOGNIZER_API_VERSION")
                    .unwrap_or_else(|| DEFAULT_FORM_RECOGNIZER_API_VERSION.to_string()),
            },
            openai: OpenAiConfig {
                endpoint: required("OPENAI_ENDPOINT"),
                key: Secret::new(required("OPENAI_KEY")),
            },
            language,
            storage: StorageAccount::from_connection_string(&Secret::new(required(
                "STORAGE_CONNECTION_STRING",
            )))?,
            inbound_container: get("INBOUND_CONTAINER").unwrap_or_else(|| "inbound".to_string()),
            outbound_container: get("OUTBOUND_CONTAINER")
                .unwrap_or_else(|| "outbound".to_string()),
            http_timeout: Duration::from_secs(parse_or(
                &get,
                "REDACT_HTTP_TIMEOUT_SECS",
                60,
                parse_number,
            )?),
            document_timeout: Duration::from_secs(parse_or(
                &get,
                "REDACT_DOCUMENT_TIMEOUT_SECS",
                300,
                parse_number,
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "REDACT_POLL_INTERVAL_MS",
                1000,
                parse_number,
            )?),
            match_policy,
            max_concurrent,
        })
    }
}

fn parse_or<T, G, P>(get: &G, key: &'static str, default: T, parse: P) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => parse(&raw).map_err(|reason| ConfigError::Invalid { key, reason }),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{}'", other)),
    }
}

fn parse_number<T: FromStr>(raw: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("expected a non-negative integer, got '{}'", raw))
}
