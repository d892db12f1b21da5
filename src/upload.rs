//! Image hosting for profile pictures.

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::types::{ChatError, Result};

/// Default upload endpoint of the hosted image API.
pub const IMGBB_UPLOAD_URL: &str = "https://api.imgbb.com/1/upload";

/// Trait for a service that stores image bytes and returns a public URL.
#[async_trait::async_trait]
pub trait ImageHost: Send + Sync {
    /// Upload `bytes` and return the hosted URL.
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    data: Option<UploadData>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    url: Option<String>,
}

/// Client for the imgbb upload API.
pub struct ImgbbClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl ImgbbClient {
    /// Creates a client using the public endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(IMGBB_UPLOAD_URL, api_key)
    }

    /// Creates a client against a custom endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn extract_url(body: &str) -> Result<String> {
        let parsed: UploadResponse = serde_json::from_str(body)
            .map_err(|e| ChatError::Upload(format!("unreadable response: {e}")))?;
        parsed
            .data
            .and_then(|d| d.url)
            .ok_or_else(|| ChatError::Upload("response carried no url".to_string()))
    }
}

#[async_trait::async_trait]
impl ImageHost for ImgbbClient {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        debug!(file_name, size = bytes.len(), "uploading image");
        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Upload(format!("{status}: {body}")));
        }

        let url = Self::extract_url(&body)?;
        info!(url = %url, "image uploaded");
        Ok(url)
    }
}

/// In-memory image host that hands out sequential URLs.
#[derive(Default)]
pub struct InMemoryImageHost {
    uploads: AtomicUsize,
    fail: bool,
}

impl InMemoryImageHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host that rejects every upload.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of successful uploads.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl ImageHost for InMemoryImageHost {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        if self.fail || bytes.is_empty() {
            return Err(ChatError::Upload(format!("rejected {file_name}")));
        }
        let n = self.uploads.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("memory://images/{n}/{file_name}"))
    }
}
