//! Media upload collaborator
//!
//! Post images arrive inline as data URIs. They are pushed to external
//! object storage, and only the returned reference (`imgId`, `imgVersion`)
//! is kept on the entity.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{FeedError, Result};

/// Reference returned by the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedMedia {
    pub public_id: String,
    pub version: u64,
}

#[async_trait]
pub trait MediaUploader: Send + Sync {
    /// Upload a `data:` URI, failing with `FeedError::Upload`
    async fn upload(&self, data_uri: &str) -> Result<UploadedMedia>;
}

/// Split a base64 `data:` URI into its content type and decoded bytes
pub fn parse_data_uri(data_uri: &str) -> Result<(String, Vec<u8>)> {
    let rest = data_uri
        .strip_prefix("data:")
        .ok_or_else(|| FeedError::Upload("Image must be a data URI".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| FeedError::Upload("Data URI has no payload".into()))?;
    let content_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| FeedError::Upload("Data URI must be base64 encoded".into()))?;

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| FeedError::Upload(format!("Invalid base64 image: {}", e)))?;
    if bytes.is_empty() {
        return Err(FeedError::Upload("Image is empty".into()));
    }

    let content_type = if content_type.is_empty() {
        "application/octet-stream"
    } else {
        content_type
    };
    Ok((content_type.to_string(), bytes))
}

/// Uploader posting raw bytes to an HTTP endpoint
pub struct HttpUploader {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpUploader {
    pub fn new(url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FeedError::Config(format!("Failed to build HTTP client: {}", e)))?;
        if let Some(url) = &url {
            info!("Media uploads go to {}", url);
        }
        Ok(Self { client, url })
    }
}

#[async_trait]
impl MediaUploader for HttpUploader {
    async fn upload(&self, data_uri: &str) -> Result<UploadedMedia> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| FeedError::Upload("No media upload endpoint configured".into()))?;
        let (content_type, bytes) = parse_data_uri(data_uri)?;
        debug!(bytes = bytes.len(), content_type = %content_type, "Uploading image");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| FeedError::Upload(format!("Upload request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| FeedError::Upload(format!("Upload rejected: {}", e)))?;

        response
            .json::<UploadedMedia>()
            .await
            .map_err(|e| FeedError::Upload(format!("Unexpected upload response: {}", e)))
    }
}
