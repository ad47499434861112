//! Shared gateway state.
//!
//! One value owns every table and client the request path needs; handlers
//! reach it through an `Arc`. Tests swap the metadata store for the
//! in-memory double and point the artifact cache at a temp directory.

use common::GatewayConfig;
use loragate_artifacts::ArtifactStore;
use loragate_engine::InferenceEngine;
use loragate_hardware::DeviceProfile;
use loragate_model_cache::{DeviceMemoryProbe, ModelCache};
use loragate_registry::{KeyCache, MetadataStore, VersionResolver};
use std::sync::Arc;

/// Everything a request handler can touch.
pub struct GatewayState {
    /// Gateway configuration.
    pub config: GatewayConfig,
    /// The inference engine.
    pub engine: InferenceEngine,
    /// The resident model cache.
    pub cache: Arc<ModelCache>,
    /// Version resolver for custom models.
    pub resolver: Arc<VersionResolver>,
    /// Metadata store (models, versions, API keys).
    pub store: Arc<dyn MetadataStore>,
    /// TTL cache for verified API keys.
    pub key_cache: KeyCache,
    /// The device models are served from.
    pub profile: DeviceProfile,
}

/// Handler-facing state handle.
pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    /// Wire up the full state graph from its leaves.
    pub fn build(
        config: GatewayConfig,
        store: Arc<dyn MetadataStore>,
        artifact_store: Arc<ArtifactStore>,
        profile: DeviceProfile,
    ) -> Self {
        let resolver = Arc::new(VersionResolver::new(store.clone()));
        let probe = Arc::new(DeviceMemoryProbe::new(profile.clone()));
        let cache = Arc::new(ModelCache::new(
            profile.clone(),
            artifact_store,
            resolver.clone(),
            probe,
            config.min_free_memory_gb,
            config.memory_soft_limit,
        ));
        let engine = InferenceEngine::new(cache.clone(), config.max_concurrent());
        Self {
            config,
            engine,
            cache,
            resolver,
            store,
            key_cache: KeyCache::default(),
            profile,
        }
    }
}
