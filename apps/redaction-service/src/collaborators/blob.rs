//! Blob storage for redacted documents
//!
//! `AzureBlobStore` talks to the Blob REST API with Shared Key
//! authorization taken from a storage connection string (Azurite's
//! `UseDevelopmentStorage=true` included). `LocalBlobStore` writes into a
//! directory and backs one-shot CLI runs.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

use super::{trim_endpoint, BlobStore};
use crate::config::{ConfigError, Secret};
use crate::error::PipelineError;

type HmacSha256 = Hmac<Sha256>;

const STORAGE_VERSION: &str = "2021-08-06";

const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// Account name, key and blob endpoint parsed from a connection string.
#[derive(Debug, Clone)]
pub struct StorageAccount {
    pub name: String,
    key: Secret,
    pub blob_endpoint: String,
}

impl StorageAccount {
    pub fn from_connection_string(connection: &Secret) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            key: "STORAGE_CONNECTION_STRING",
            reason: reason.to_string(),
        };

        let parts: HashMap<String, String> = connection
            .expose()
            .split(';')
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        if parts
            .get("usedevelopmentstorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Ok(Self {
                name: DEV_ACCOUNT.to_string(),
                key: Secret::new(DEV_KEY),
                blob_endpoint: DEV_BLOB_ENDPOINT.to_string(),
            });
        }

        let name = parts
            .get("accountname")
            .cloned()
            .ok_or_else(|| invalid("missing AccountName"))?;
        let key = parts
            .get("accountkey")
            .cloned()
            .ok_or_else(|| invalid("missing AccountKey"))?;
        STANDARD
            .decode(&key)
            .map_err(|_| invalid("AccountKey is not base64"))?;

        let blob_endpoint = match parts.get("blobendpoint") {
            Some(endpoint) => trim_endpoint(endpoint).to_string(),
            None => {
                let protocol = parts
                    .get("defaultendpointsprotocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = parts
                    .get("endpointsuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{}://{}.blob.{}", protocol, name, suffix)
            }
        };

        Ok(Self {
            name,
            key: Secret::new(key),
            blob_endpoint,
        })
    }

    /// Base64 HMAC-SHA256 of `string_to_sign` with the account key.
    fn sign(&self, string_to_sign: &str) -> Result<String, PipelineError> {
        let key = STANDARD
            .decode(self.key.expose())
            .map_err(|_| PipelineError::Delivery("storage key is not base64".into()))?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| PipelineError::Delivery(format!("invalid storage key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// Shared Key string-to-sign for a request without conditional headers.
///
/// `resource_path` is the URL path as sent, starting with `/`.
fn string_to_sign(
    account: &str,
    method: &str,
    resource_path: &str,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(&str, &str)],
) -> String {
    let mut headers: Vec<(String, &str)> = ms_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    headers.sort();

    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut out = format!(
        "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n",
        method, length, content_type
    );
    for (name, value) in headers {
        out.push_str(&format!("{}:{}\n", name, value));
    }
    out.push_str(&format!("/{}{}", account, resource_path));
    out
}

/// Percent-encode each path segment of a blob name.
fn encode_blob_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct AzureBlobStore {
    http: reqwest::Client,
    account: StorageAccount,
}

impl AzureBlobStore {
    pub fn new(http: reqwest::Client, account: StorageAccount) -> Self {
        Self { http, account }
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn put(&self, container: &str, name: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        let url = format!(
            "{}/{}/{}",
            self.account.blob_endpoint,
            container,
            encode_blob_name(name)
        );
        let parsed = reqwest::Url::parse(&url)
            .map_err(|e| PipelineError::Delivery(format!("invalid blob URL: {}", e)))?;

        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let content_type = "application/pdf";
        let ms_headers = [
            ("x-ms-blob-type", "BlockBlob"),
            ("x-ms-date", date.as_str()),
            ("x-ms-version", STORAGE_VERSION),
        ];

        let to_sign = string_to_sign(
            &self.account.name,
            "PUT",
            parsed.path(),
            bytes.len(),
            content_type,
            &ms_headers,
        );
        let signature = self.account.sign(&to_sign)?;

        let mut request = self
            .http
            .put(parsed)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("SharedKey {}:{}", self.account.name, signature),
            );
        for (header, value) in ms_headers {
            request = request.header(header, value);
        }

        let size = bytes.len();
        let response = request
            .body(bytes)
            .send()
            .await
            .map_err(|e| PipelineError::Delivery(format!("upload failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Delivery(format!(
                "upload returned {}",
                status
            )));
        }

        info!(container, bytes = size, "Uploaded redacted document");
        Ok(())
    }
}

/// Writes blobs to `<root>/<container>/<name>`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, container: &str, name: &str) -> Result<PathBuf, PipelineError> {
        let relative = Path::new(container).join(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || name.is_empty() {
            return Err(PipelineError::Delivery(format!(
                "refusing to write outside the output directory: {}/{}",
                container, name
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, container: &str, name: &str, bytes: Vec<u8>) -> Result<(), PipelineError> {
        let path = self.target(container, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Delivery(format!("create directory: {}", e)))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| PipelineError::Delivery(format!("write {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), bytes = bytes.len(), "Wrote redacted document");
        Ok(())
    }
}
