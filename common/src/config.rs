//! Environment-driven gateway configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration loaded from environment variables with defaults
/// suitable for a single Cloud Run style replica.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Object-store bucket holding model artifacts.
    pub gcs_bucket: String,
    /// Key prefix under the bucket (always with a trailing `/`).
    pub gcs_model_prefix: String,
    /// Optional mounted-filesystem root mirroring the bucket.
    pub mount_path: Option<PathBuf>,
    /// Local download cache for artifacts.
    pub local_model_cache: PathBuf,
    /// Soft fraction of device memory the resident set may occupy.
    pub memory_soft_limit: f64,
    /// Minimum headroom (GB) kept free when loading.
    pub min_free_memory_gb: f64,
    /// Process-wide concurrent generation bound.
    pub max_concurrent_requests: usize,
    /// Transport keep-alive budget in seconds.
    pub request_timeout_secs: u64,
    /// Whether bearer auth is enforced.
    pub require_auth: bool,
    /// Static bearer token granting `*` base-model access.
    pub base_model_api_key: Option<String>,
    /// Local development mode (forces concurrency 1).
    pub local_dev: bool,
    /// HTTP bind port.
    pub port: u16,
    /// HTTP bind host.
    pub host: String,
    /// GCP project for the metadata store.
    pub gcp_project: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gcs_bucket: "your-models-bucket".to_string(),
            gcs_model_prefix: "models/".to_string(),
            mount_path: None,
            local_model_cache: std::env::temp_dir().join("model_cache"),
            memory_soft_limit: 0.8,
            min_free_memory_gb: 2.0,
            max_concurrent_requests: 50,
            request_timeout_secs: 300,
            require_auth: true,
            base_model_api_key: None,
            local_dev: false,
            port: 8080,
            host: "0.0.0.0".to_string(),
            gcp_project: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary lookup. Split out so tests can
    /// drive the parsing without touching process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let mut prefix =
            lookup("GCS_MODEL_PREFIX").unwrap_or_else(|| defaults.gcs_model_prefix.clone());
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        Self {
            gcs_bucket: lookup("GCS_BUCKET").unwrap_or(defaults.gcs_bucket),
            gcs_model_prefix: prefix,
            mount_path: lookup("MOUNT_PATH").filter(|p| !p.is_empty()).map(PathBuf::from),
            local_model_cache: lookup("LOCAL_MODEL_CACHE")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_model_cache),
            memory_soft_limit: parse_or(&lookup, "MEMORY_SOFT_LIMIT", defaults.memory_soft_limit)
                .clamp(0.0, 1.0),
            min_free_memory_gb: parse_or(
                &lookup,
                "MIN_FREE_MEMORY_GB",
                defaults.min_free_memory_gb,
            ),
            max_concurrent_requests: parse_or(
                &lookup,
                "MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            ),
            request_timeout_secs: parse_or(
                &lookup,
                "REQUEST_TIMEOUT",
                defaults.request_timeout_secs,
            ),
            require_auth: parse_bool(&lookup, "REQUIRE_AUTH", defaults.require_auth),
            base_model_api_key: lookup("BASE_MODEL_API_KEY").filter(|k| !k.is_empty()),
            local_dev: parse_bool(&lookup, "LOCAL_DEV", defaults.local_dev),
            port: parse_or(&lookup, "PORT", defaults.port),
            host: lookup("HOST").unwrap_or(defaults.host),
            gcp_project: lookup("GCP_PROJECT")
                .or_else(|| lookup("GOOGLE_CLOUD_PROJECT"))
                .filter(|p| !p.is_empty()),
        }
    }

    /// Effective concurrency bound; local dev serializes all requests.
    pub fn max_concurrent(&self) -> usize {
        if self.local_dev {
            1
        } else {
            self.max_concurrent_requests
        }
    }

    /// Transport keep-alive budget.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        None => default,
    }
}
