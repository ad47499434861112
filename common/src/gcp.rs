//! Access-token provider backed by the GCP metadata server.
//!
//! Inside Cloud Run / GCE the metadata server mints short-lived access
//! tokens for the attached service account. Outside GCP the endpoint is
//! unreachable and callers proceed unauthenticated (public buckets,
//! emulators).

use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Caches one metadata-server access token until shortly before expiry.
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    cached: Mutex<Option<(String, Instant)>>,
}

impl Default for MetadataTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataTokenProvider {
    /// Build a provider with a short connect timeout so non-GCP hosts fail
    /// fast instead of hanging startup.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self { client, cached: Mutex::new(None) }
    }

    /// Return a bearer token, or `None` when the metadata server is
    /// unreachable.
    pub async fn token(&self) -> Option<String> {
        if let Some((token, expires_at)) = self.cached.lock().clone() {
            if Instant::now() < expires_at {
                return Some(token);
            }
        }

        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "metadata server refused token request");
            return None;
        }
        let body: TokenResponse = response.json().await.ok()?;

        let ttl = Duration::from_secs(body.expires_in).saturating_sub(EXPIRY_SLACK);
        *self.cached.lock() = Some((body.access_token.clone(), Instant::now() + ttl));
        debug!(expires_in = body.expires_in, "fetched metadata-server access token");
        Some(body.access_token)
    }
}
