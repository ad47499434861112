//! Minimal GCS JSON-API client.
//!
//! Lists and downloads objects via `storage.googleapis.com`, streaming
//! download bodies straight to disk. Authenticates with metadata-server
//! tokens when available; anonymous access works for public buckets.

use common::MetadataTokenProvider;
use futures::StreamExt;
use loragate_values::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const GCS_BASE: &str = "https://storage.googleapis.com/storage/v1";

/// One object listed under a prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct GcsObject {
    /// Full object name (key) within the bucket.
    pub name: String,
    /// Object size in bytes, as reported by the API.
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Read-only client for one bucket.
pub struct GcsClient {
    http: reqwest::Client,
    bucket: String,
    token: Arc<MetadataTokenProvider>,
}

impl GcsClient {
    /// Client for `bucket`.
    pub fn new(bucket: impl Into<String>, token: Arc<MetadataTokenProvider>) -> Self {
        Self { http: reqwest::Client::new(), bucket: bucket.into(), token }
    }

    /// The bucket this client reads from.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// List every object under `prefix`, following pagination.
    pub async fn list(&self, prefix: &str) -> GatewayResult<Vec<GcsObject>> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let url = format!("{GCS_BASE}/b/{}/o", self.bucket);
            let mut request = self.http.get(&url).query(&[("prefix", prefix)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = self
                .authorize(request)
                .await
                .send()
                .await
                .map_err(|e| transport("list", &e.to_string()))?;
            if !response.status().is_success() {
                return Err(transport("list", &format!("HTTP {}", response.status())));
            }
            let page: ListResponse =
                response.json().await.map_err(|e| transport("list", &e.to_string()))?;

            objects.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(prefix, count = objects.len(), "listed GCS objects");
        Ok(objects)
    }

    /// Cheap existence probe: is there at least one object under `prefix`?
    pub async fn exists_any(&self, prefix: &str) -> GatewayResult<bool> {
        let url = format!("{GCS_BASE}/b/{}/o", self.bucket);
        let request =
            self.http.get(&url).query(&[("prefix", prefix), ("maxResults", "1")]);
        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|e| transport("probe", &e.to_string()))?;
        if !response.status().is_success() {
            return Err(transport("probe", &format!("HTTP {}", response.status())));
        }
        let page: ListResponse =
            response.json().await.map_err(|e| transport("probe", &e.to_string()))?;
        Ok(!page.items.is_empty())
    }

    /// Stream one object to `dest`, creating parent directories.
    pub async fn download_to(&self, object: &str, dest: &Path) -> GatewayResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transport("download", &e.to_string()))?;
        }

        let url = format!(
            "{GCS_BASE}/b/{}/o/{}?alt=media",
            self.bucket,
            urlencode(object)
        );
        let response = self
            .authorize(self.http.get(&url))
            .await
            .send()
            .await
            .map_err(|e| transport("download", &e.to_string()))?;
        if !response.status().is_success() {
            return Err(transport(
                "download",
                &format!("HTTP {} for {object}", response.status()),
            ));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| transport("download", &e.to_string()))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport("download", &e.to_string()))?;
            written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| transport("download", &e.to_string()))?;
        }
        file.flush().await.map_err(|e| transport("download", &e.to_string()))?;

        debug!(object, bytes = written, "downloaded object");
        Ok(())
    }

    /// Fetch one small object as text; `None` when it does not exist.
    pub async fn fetch_text(&self, object: &str) -> GatewayResult<Option<String>> {
        let url = format!(
            "{GCS_BASE}/b/{}/o/{}?alt=media",
            self.bucket,
            urlencode(object)
        );
        let response = self
            .authorize(self.http.get(&url))
            .await
            .send()
            .await
            .map_err(|e| transport("fetch", &e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(transport("fetch", &format!("HTTP {} for {object}", response.status())));
        }
        let text = response.text().await.map_err(|e| transport("fetch", &e.to_string()))?;
        info!(object, "fetched object from GCS");
        Ok(Some(text))
    }
}

fn transport(op: &str, detail: &str) -> GatewayError {
    GatewayError::Internal(format!("GCS {op} failed: {detail}"))
}

/// Percent-encode an object name for the `/o/{name}` path segment.
fn urlencode(object: &str) -> String {
    let mut out = String::with_capacity(object.len() * 3);
    for byte in object.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
