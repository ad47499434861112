//! Version resolution for custom models with time-bounded caching.

use crate::store::{MetadataStore, StoreError};
use common::ModelName;
use loragate_values::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default cache TTL: 15 minutes.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(900);

/// One entry in the diagnostic cache listing.
#[derive(Debug, Clone, Serialize)]
pub struct VersionCacheEntry {
    /// Custom model name
    pub name: String,
    /// Cached version label
    pub version: String,
    /// Seconds since the entry was cached
    pub age_seconds: f64,
}

/// Diagnostic snapshot of the version cache.
#[derive(Debug, Clone, Serialize)]
pub struct VersionCacheStats {
    /// Number of cached models
    pub cached_models: usize,
    /// Configured TTL in seconds
    pub cache_ttl_seconds: u64,
    /// Per-entry detail
    pub models: Vec<VersionCacheEntry>,
}

/// Maps custom model names to their active version label, caching results
/// to keep the metadata store off the request hot path.
pub struct VersionResolver {
    store: Arc<dyn MetadataStore>,
    cache: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl VersionResolver {
    /// Resolver with the default 15-minute TTL.
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    /// Resolver with an explicit TTL (tests use short ones).
    pub fn with_ttl(store: Arc<dyn MetadataStore>, ttl: Duration) -> Self {
        info!(ttl_seconds = ttl.as_secs(), "initialized version resolver");
        Self { store, cache: Mutex::new(HashMap::new()), ttl }
    }

    /// Resolve the active version label for a model.
    ///
    /// Returns `None` for base identifiers, which are never versioned. Cache
    /// hits within the TTL never touch the store; resolution failures are
    /// never cached.
    pub async fn resolve(&self, name: &ModelName) -> GatewayResult<Option<String>> {
        if name.is_base() {
            debug!(model = %name, "base model, no version resolution needed");
            return Ok(None);
        }

        if let Some((label, cached_at)) = self.cache.lock().get(name.as_str()).cloned() {
            let age = cached_at.elapsed();
            if age < self.ttl {
                debug!(model = %name, version = %label, age_secs = age.as_secs_f64(), "version cache hit");
                return Ok(Some(label));
            }
            debug!(model = %name, age_secs = age.as_secs_f64(), "version cache entry expired");
        }

        info!(model = %name, "querying metadata store for active version");
        let label = self.query_active_version(name.as_str()).await?;

        self.cache.lock().insert(name.as_str().to_string(), (label.clone(), Instant::now()));
        info!(model = %name, version = %label, "cached active version");
        Ok(Some(label))
    }

    async fn query_active_version(&self, name: &str) -> GatewayResult<String> {
        let model = self
            .store
            .find_model(name)
            .await
            .map_err(store_unavailable)?
            .ok_or_else(|| unresolved(name, "model not found"))?;

        let active_version_id = model.active_version_id.ok_or_else(|| {
            unresolved(name, "model has no active version; activate one in the web interface")
        })?;

        let version = self
            .store
            .get_version(&model.doc_id, &active_version_id)
            .await
            .map_err(store_unavailable)?
            .ok_or_else(|| {
                unresolved(name, &format!("active version {active_version_id} not found"))
            })?;

        version.version_label.ok_or_else(|| {
            unresolved(name, &format!("version {active_version_id} missing versionLabel"))
        })
    }

    /// Drop one cached entry. Returns whether an entry was removed.
    pub fn invalidate(&self, name: &ModelName) -> bool {
        let removed = self.cache.lock().remove(name.as_str()).is_some();
        if removed {
            info!(model = %name, "invalidated version cache entry");
        } else {
            debug!(model = %name, "no version cache entry to invalidate");
        }
        removed
    }

    /// Drop all cached entries. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        let mut cache = self.cache.lock();
        let count = cache.len();
        cache.clear();
        info!(count, "cleared version cache");
        count
    }

    /// Diagnostic snapshot for the admin surface.
    pub fn stats(&self) -> VersionCacheStats {
        let cache = self.cache.lock();
        VersionCacheStats {
            cached_models: cache.len(),
            cache_ttl_seconds: self.ttl.as_secs(),
            models: cache
                .iter()
                .map(|(name, (label, cached_at))| VersionCacheEntry {
                    name: name.clone(),
                    version: label.clone(),
                    age_seconds: cached_at.elapsed().as_secs_f64(),
                })
                .collect(),
        }
    }
}

fn store_unavailable(e: StoreError) -> GatewayError {
    GatewayError::MetadataStoreUnavailable(e.to_string())
}

fn unresolved(name: &str, reason: &str) -> GatewayError {
    GatewayError::VersionUnresolved { model: name.to_string(), reason: reason.to_string() }
}
