//! Two-tier resident model cache.
//!
//! Base models and fine-tuned (adapted) views live in separate tables. An
//! adapted entry references its base by name and owns only the LoRA
//! adapter, so a base with live adapted references is never evicted.
//! Loading is single-flight per model name via per-name async locks created
//! on demand and removed with their entry.

use crate::llama::LlamaModel;
use crate::loader::load_model_weights;
use crate::lora::LoraAdapter;
use crate::tokenizer::{load_tokenizer, TokenizerProfile};
use common::ModelName;
use loragate_artifacts::ArtifactStore;
use loragate_hardware::{self as hardware, format_memory_size, DeviceProfile};
use loragate_registry::VersionResolver;
use loragate_values::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Answers "how much memory is free" and releases device caches between
/// eviction steps. Swappable so tests can script memory pressure.
pub trait MemoryProbe: Send + Sync {
    /// Currently free memory in GB for the serving device.
    fn available_gb(&self) -> f64;
    /// Release freed device buffers after entries were dropped.
    fn release(&self);
}

/// Production probe backed by the hardware crate.
pub struct DeviceMemoryProbe {
    profile: DeviceProfile,
}

impl DeviceMemoryProbe {
    /// Probe for the given device profile.
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }
}

impl MemoryProbe for DeviceMemoryProbe {
    fn available_gb(&self) -> f64 {
        hardware::available_memory(self.profile.kind).0
    }

    fn release(&self) {
        self.profile.release_device_cache();
    }
}

/// A resident base model: weights, tokenizer and its profile.
#[derive(Debug)]
pub struct ResidentBase {
    /// The loaded decoder.
    pub model: Arc<LlamaModel>,
    /// The unmodified upstream tokenizer.
    pub tokenizer: Arc<Tokenizer>,
    /// Gateway-side tokenizer configuration.
    pub profile: Arc<TokenizerProfile>,
    /// Measured resident memory in GB.
    pub memory_gb: f64,
}

/// Handle returned by [`ModelCache::get_model`]: a base reference plus an
/// optional owned adapter. Generation dispatches through the same decoder
/// either way; the adapter rides along as call-time deltas.
#[derive(Clone, Debug)]
pub struct ResidentModel {
    /// The logical model name the request asked for.
    pub name: String,
    /// The base this handle generates with.
    pub base: Arc<ResidentBase>,
    /// LoRA adapter for fine-tuned models, `None` for plain bases.
    pub adapter: Option<Arc<LoraAdapter>>,
    /// Memory attributed to this entry (adapter-only for fine-tunes).
    pub memory_gb: f64,
}

struct BaseEntry {
    resident: Arc<ResidentBase>,
    last_access: Instant,
}

struct AdaptedEntry {
    base_name: String,
    adapter: Arc<LoraAdapter>,
    memory_gb: f64,
    last_access: Instant,
}

/// One row of the admin stats listing.
#[derive(Debug, Clone, Serialize)]
pub struct ResidentModelStats {
    /// Model name
    pub name: String,
    /// `base` or `fine_tuned`
    pub kind: &'static str,
    /// Memory attributed to the entry in GB
    pub memory_gb: f64,
    /// For fine-tunes, the base they compose over
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
}

/// The two-tier cache.
pub struct ModelCache {
    profile: DeviceProfile,
    store: Arc<ArtifactStore>,
    resolver: Arc<VersionResolver>,
    probe: Arc<dyn MemoryProbe>,
    min_free_gb: f64,
    memory_soft_limit: f64,
    bases: Mutex<HashMap<String, BaseEntry>>,
    adapted: Mutex<HashMap<String, AdaptedEntry>>,
    load_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModelCache {
    /// Build the cache.
    pub fn new(
        profile: DeviceProfile,
        store: Arc<ArtifactStore>,
        resolver: Arc<VersionResolver>,
        probe: Arc<dyn MemoryProbe>,
        min_free_gb: f64,
        memory_soft_limit: f64,
    ) -> Self {
        Self {
            profile,
            store,
            resolver,
            probe,
            min_free_gb,
            memory_soft_limit: memory_soft_limit.clamp(0.0, 1.0),
            bases: Mutex::new(HashMap::new()),
            adapted: Mutex::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The device profile models load onto.
    pub fn device_profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Return a resident handle for `name`, loading it if necessary.
    /// Concurrent callers for the same name join a single in-flight load.
    pub async fn get_model(&self, name: &ModelName) -> GatewayResult<ResidentModel> {
        if let Some(handle) = self.lookup(name) {
            debug!(model = %name, "using cached model");
            return Ok(handle);
        }

        let lock = self.load_lock(name.as_str());
        let _guard = lock.lock().await;
        // A waiter may find the model loaded by the lock holder ahead of it.
        if let Some(handle) = self.lookup(name) {
            return Ok(handle);
        }

        info!(model = %name, "loading model");
        let version = self.resolver.resolve(name).await?;
        let training = self.store.read_training_config(name, version.as_deref()).await?;

        match training.and_then(|t| t.base_model) {
            Some(base) if base != name.as_str() => {
                self.load_adapted_locked(name, version.as_deref(), &base).await
            }
            Some(_) => Err(GatewayError::LoadFailed {
                model: name.to_string(),
                reason: "training config lists the model as its own base".to_string(),
            }),
            None => {
                let resident = self.load_base_locked(name, version.as_deref()).await?;
                Ok(ResidentModel {
                    name: name.to_string(),
                    memory_gb: resident.memory_gb,
                    base: resident,
                    adapter: None,
                })
            }
        }
    }

    async fn load_adapted_locked(
        &self,
        name: &ModelName,
        version: Option<&str>,
        base_model: &str,
    ) -> GatewayResult<ResidentModel> {
        info!(model = %name, base = base_model, "detected fine-tuned model");
        let base_name = ModelName::new(base_model);
        let base = self.ensure_base(&base_name).await?;

        let adapter_dir = self.store.locate_adapter(name, version).await?;
        let device = self.profile.device.clone();
        let dtype = self.profile.precision.dtype();
        let adapter = tokio::task::spawn_blocking(move || {
            LoraAdapter::load(&adapter_dir, &device, dtype)
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("adapter load task failed: {e}")))??;

        let memory_gb = adapter.memory_gb;
        let adapter = Arc::new(adapter);
        self.adapted.lock().insert(
            name.as_str().to_string(),
            AdaptedEntry {
                base_name: base_name.as_str().to_string(),
                adapter: adapter.clone(),
                memory_gb,
                last_access: Instant::now(),
            },
        );
        info!(model = %name, memory = %format_memory_size(memory_gb), "fine-tuned model loaded");

        Ok(ResidentModel { name: name.to_string(), base, adapter: Some(adapter), memory_gb })
    }

    /// Load a base model if not resident, taking its own per-name lock.
    async fn ensure_base(&self, name: &ModelName) -> GatewayResult<Arc<ResidentBase>> {
        if let Some(base) = self.touch_base(name.as_str()) {
            debug!(model = %name, "using cached base model");
            return Ok(base);
        }
        let lock = self.load_lock(name.as_str());
        let _guard = lock.lock().await;
        if let Some(base) = self.touch_base(name.as_str()) {
            return Ok(base);
        }
        self.load_base_locked(name, None).await
    }

    /// Load a base model; caller must hold the per-name load lock.
    async fn load_base_locked(
        &self,
        name: &ModelName,
        version: Option<&str>,
    ) -> GatewayResult<Arc<ResidentBase>> {
        let estimated =
            hardware::estimate_model_memory_gb(name.as_str(), self.profile.precision);
        info!(
            model = %name,
            estimated = %format_memory_size(estimated),
            precision = %self.profile.precision,
            "estimated memory requirement"
        );
        self.evict_for_memory(estimated);

        let artifact_dir = self.store.locate(name, version).await?;

        let profile = self.profile.clone();
        let model_id = name.as_str().to_string();
        let (tokenizer, tok_profile, loaded) = tokio::task::spawn_blocking(move || {
            let (tokenizer, tok_profile) = load_tokenizer(&artifact_dir, &model_id)?;
            let loaded = load_model_weights(&artifact_dir, &profile, &model_id)?;
            Ok::<_, GatewayError>((tokenizer, tok_profile, loaded))
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("model load task failed: {e}")))??;

        info!(
            model = %name,
            memory = %format_memory_size(loaded.weights_gb),
            "base model loaded"
        );
        let resident = Arc::new(ResidentBase {
            model: Arc::new(loaded.model),
            tokenizer: Arc::new(tokenizer),
            profile: Arc::new(tok_profile),
            memory_gb: loaded.weights_gb,
        });
        self.bases.lock().insert(
            name.as_str().to_string(),
            BaseEntry { resident: resident.clone(), last_access: Instant::now() },
        );
        Ok(resident)
    }

    /// Evict entries until `required_gb` plus the configured headroom is
    /// free. Best-effort: when no candidate remains the load proceeds and
    /// may later fail with a framework out-of-memory error.
    pub fn evict_for_memory(&self, required_gb: f64) {
        loop {
            let available = self.probe.available_gb();
            let needed = required_gb + self.min_free_gb;
            // Soft cap: the resident set may occupy at most the configured
            // fraction of the memory pool it shares with free space.
            let resident = self.total_resident_gb();
            let soft_budget = (available + resident) * self.memory_soft_limit;
            info!(
                available = %format_memory_size(available),
                required = %format_memory_size(required_gb),
                resident = %format_memory_size(resident),
                "memory check"
            );
            if available >= needed && resident + required_gb <= soft_budget {
                return;
            }
            if !self.evict_one() {
                warn!(
                    missing = %format_memory_size(needed - available),
                    "insufficient memory and no eviction candidates, proceeding with load"
                );
                return;
            }
            self.probe.release();
        }
    }

    /// Evict a single entry: fine-tuned LRU first, then base models in LRU
    /// order among those with no live adapted references.
    fn evict_one(&self) -> bool {
        let victim = {
            let adapted = self.adapted.lock();
            adapted
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(name, _)| name.clone())
        };
        if let Some(name) = victim {
            let removed = self.adapted.lock().remove(&name);
            if let Some(entry) = removed {
                self.drop_lock(&name);
                info!(
                    model = %name,
                    freed = %format_memory_size(entry.memory_gb),
                    "evicting LRU fine-tuned model"
                );
                return true;
            }
        }

        let refcounts = self.base_refcounts();
        let victim = {
            let bases = self.bases.lock();
            let mut candidates: Vec<(&String, Instant)> = bases
                .iter()
                .filter(|(name, _)| refcounts.get(*name).copied().unwrap_or(0) == 0)
                .map(|(name, entry)| (name, entry.last_access))
                .collect();
            candidates.sort_by_key(|(_, at)| *at);
            candidates.first().map(|(name, _)| (*name).clone())
        };
        if let Some(name) = victim {
            if let Some(entry) = self.bases.lock().remove(&name) {
                self.drop_lock(&name);
                info!(
                    model = %name,
                    freed = %format_memory_size(entry.resident.memory_gb),
                    "evicting LRU base model"
                );
                return true;
            }
        }

        warn!("cannot evict base models - all are in use by fine-tuned models");
        false
    }

    /// Force removal of a model; idempotent. Removing a base also removes
    /// the adapted entries composed on it so a dangling base reference can
    /// never be observed. Returns whether anything was removed.
    pub fn unload(&self, name: &ModelName) -> bool {
        let mut removed = false;

        if self.adapted.lock().remove(name.as_str()).is_some() {
            info!(model = %name, "unloaded fine-tuned model");
            removed = true;
        }

        if self.bases.lock().remove(name.as_str()).is_some() {
            info!(model = %name, "unloaded base model");
            removed = true;
            let dependents: Vec<String> = {
                let adapted = self.adapted.lock();
                adapted
                    .iter()
                    .filter(|(_, entry)| entry.base_name == name.as_str())
                    .map(|(dep, _)| dep.clone())
                    .collect()
            };
            for dep in dependents {
                self.adapted.lock().remove(&dep);
                self.drop_lock(&dep);
                info!(model = %dep, base = %name, "unloaded dependent fine-tuned model");
            }
        }

        if removed {
            self.drop_lock(name.as_str());
            self.probe.release();
        } else {
            debug!(model = %name, "unload requested for non-resident model");
        }
        removed
    }

    /// Names of all resident entries, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapted.lock().keys().cloned().collect();
        names.extend(self.bases.lock().keys().cloned());
        names.sort();
        names
    }

    /// Per-entry stats for the admin surface.
    pub fn stats(&self) -> Vec<ResidentModelStats> {
        let mut rows: Vec<ResidentModelStats> = self
            .adapted
            .lock()
            .iter()
            .map(|(name, entry)| ResidentModelStats {
                name: name.clone(),
                kind: "fine_tuned",
                memory_gb: entry.memory_gb,
                base_model: Some(entry.base_name.clone()),
            })
            .collect();
        rows.extend(self.bases.lock().iter().map(|(name, entry)| ResidentModelStats {
            name: name.clone(),
            kind: "base",
            memory_gb: entry.resident.memory_gb,
            base_model: None,
        }));
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Total memory attributed to resident entries in GB.
    pub fn total_resident_gb(&self) -> f64 {
        let adapted: f64 = self.adapted.lock().values().map(|e| e.memory_gb).sum();
        let bases: f64 = self.bases.lock().values().map(|e| e.resident.memory_gb).sum();
        adapted + bases
    }

    fn lookup(&self, name: &ModelName) -> Option<ResidentModel> {
        let adapted_hit = {
            let mut adapted = self.adapted.lock();
            adapted.get_mut(name.as_str()).map(|entry| {
                entry.last_access = Instant::now();
                (entry.base_name.clone(), entry.adapter.clone(), entry.memory_gb)
            })
        };
        if let Some((base_name, adapter, memory_gb)) = adapted_hit {
            let base = self.touch_base(&base_name)?;
            return Some(ResidentModel {
                name: name.to_string(),
                base,
                adapter: Some(adapter),
                memory_gb,
            });
        }

        self.touch_base(name.as_str()).map(|base| ResidentModel {
            name: name.to_string(),
            memory_gb: base.memory_gb,
            base,
            adapter: None,
        })
    }

    fn touch_base(&self, name: &str) -> Option<Arc<ResidentBase>> {
        let mut bases = self.bases.lock();
        bases.get_mut(name).map(|entry| {
            entry.last_access = Instant::now();
            entry.resident.clone()
        })
    }

    fn base_refcounts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.adapted.lock().values() {
            *counts.entry(entry.base_name.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn load_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn drop_lock(&self, name: &str) {
        self.load_locks.lock().remove(name);
    }

    #[cfg(test)]
    fn insert_base_for_test(&self, name: &str, memory_gb: f64) {
        use crate::llama::tests::tiny_model;
        use crate::tokenizer::tests::char_tokenizer;
        use crate::tokenizer::DEFAULT_CHAT_TEMPLATE;

        let resident = Arc::new(ResidentBase {
            model: Arc::new(tiny_model()),
            tokenizer: Arc::new(char_tokenizer()),
            profile: Arc::new(TokenizerProfile {
                eos_token_id: None,
                pad_token_id: None,
                chat_template: DEFAULT_CHAT_TEMPLATE.to_string(),
                native_chat_template: false,
                stop_tokens: vec!["User:".to_string()],
                bos_token: None,
                eos_token: None,
            }),
            memory_gb,
        });
        self.bases
            .lock()
            .insert(name.to_string(), BaseEntry { resident, last_access: Instant::now() });
    }

    #[cfg(test)]
    fn insert_adapted_for_test(&self, name: &str, base_name: &str, memory_gb: f64) {
        use candle_core::{DType, Device, Tensor};

        // Minimal one-module adapter; never used for generation in these
        // tests.
        let a = Tensor::zeros((1, 16), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((16, 1), DType::F32, &Device::Cpu).unwrap();
        let mut deltas = HashMap::new();
        deltas.insert((0usize, "q_proj".to_string()), crate::lora::LoraDelta::from_parts(a, b, 1.0));
        let adapter = Arc::new(crate::lora::LoraAdapter::from_parts(deltas, memory_gb));
        self.adapted.lock().insert(
            name.to_string(),
            AdaptedEntry {
                base_name: base_name.to_string(),
                adapter,
                memory_gb,
                last_access: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::GatewayConfig;
    use loragate_registry::{MemoryStore, VersionResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted probe: a fixed sequence of free-memory readings.
    struct ScriptedProbe {
        readings: Vec<f64>,
        cursor: AtomicUsize,
        releases: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<f64>) -> Self {
            Self { readings, cursor: AtomicUsize::new(0), releases: AtomicUsize::new(0) }
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn available_gb(&self) -> f64 {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            *self.readings.get(i).or(self.readings.last()).unwrap_or(&0.0)
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Probe that always reports plenty of memory.
    struct AmpleProbe;

    impl MemoryProbe for AmpleProbe {
        fn available_gb(&self) -> f64 {
            1024.0
        }
        fn release(&self) {}
    }

    fn cache_with_probe(probe: Arc<dyn MemoryProbe>) -> (ModelCache, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = GatewayConfig {
            local_model_cache: tmp.path().to_path_buf(),
            ..GatewayConfig::default()
        };
        let store = Arc::new(ArtifactStore::new(&config, None).unwrap());
        let resolver = Arc::new(VersionResolver::new(Arc::new(MemoryStore::new())));
        let cache =
            ModelCache::new(DeviceProfile::cpu(), store, resolver, probe, 2.0, 0.8);
        (cache, tmp)
    }

    #[test]
    fn unload_is_idempotent_and_removes_from_list() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        cache.insert_base_for_test("meta-llama/Llama-3.2-1B", 2.5);
        assert_eq!(cache.list(), vec!["meta-llama/Llama-3.2-1B".to_string()]);

        let name = ModelName::new("meta-llama/Llama-3.2-1B");
        assert!(cache.unload(&name));
        assert!(cache.list().is_empty());
        assert!(!cache.unload(&name));
    }

    #[test]
    fn eviction_prefers_fine_tuned_entries() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        cache.insert_base_for_test("base/one", 4.0);
        cache.insert_adapted_for_test("tune-a", "base/one", 0.05);

        assert!(cache.evict_one());
        // The fine-tuned entry went first; the base stays.
        assert_eq!(cache.list(), vec!["base/one".to_string()]);
    }

    #[test]
    fn eviction_respects_base_refcounts() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        cache.insert_base_for_test("base/one", 4.0);
        cache.insert_adapted_for_test("tune-a", "base/one", 0.05);
        cache.insert_adapted_for_test("tune-b", "base/one", 0.05);

        // Two evictions take both fine-tunes; the base survives both.
        assert!(cache.evict_one());
        assert!(cache.evict_one());
        assert_eq!(cache.list(), vec!["base/one".to_string()]);

        // Only once no adapted entry references it does the base go.
        assert!(cache.evict_one());
        assert!(cache.list().is_empty());
    }

    #[test]
    fn eviction_with_no_candidates_reports_failure() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        assert!(!cache.evict_one());
    }

    #[test]
    fn evict_for_memory_stops_when_satisfied() {
        // First reading is under pressure, second is fine.
        let probe = Arc::new(ScriptedProbe::new(vec![1.0, 50.0]));
        let (cache, _tmp) = cache_with_probe(probe.clone());
        cache.insert_base_for_test("base/one", 4.0);
        cache.insert_adapted_for_test("tune-a", "base/one", 0.05);

        cache.evict_for_memory(10.0);
        // One eviction happened, then the probe reported enough memory.
        assert_eq!(cache.list(), vec!["base/one".to_string()]);
        assert_eq!(probe.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn evict_for_memory_proceeds_when_nothing_left() {
        let probe = Arc::new(ScriptedProbe::new(vec![1.0]));
        let (cache, _tmp) = cache_with_probe(probe);
        // No entries at all: must log and return, not spin.
        cache.evict_for_memory(10.0);
    }

    #[test]
    fn unloading_a_base_takes_its_dependents() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        cache.insert_base_for_test("base/one", 4.0);
        cache.insert_adapted_for_test("tune-a", "base/one", 0.05);

        assert!(cache.unload(&ModelName::new("base/one")));
        assert!(cache.list().is_empty());
    }

    #[test]
    fn lookup_returns_adapter_for_fine_tunes() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        cache.insert_base_for_test("base/one", 4.0);
        cache.insert_adapted_for_test("tune-a", "base/one", 0.05);

        let handle = cache.lookup(&ModelName::new("tune-a")).unwrap();
        assert!(handle.adapter.is_some());
        assert_eq!(handle.memory_gb, 0.05);

        let handle = cache.lookup(&ModelName::new("base/one")).unwrap();
        assert!(handle.adapter.is_none());
    }

    #[test]
    fn stats_reports_both_tiers() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        cache.insert_base_for_test("base/one", 4.0);
        cache.insert_adapted_for_test("tune-a", "base/one", 0.05);

        let stats = cache.stats();
        assert_eq!(stats.len(), 2);
        let tune = stats.iter().find(|s| s.name == "tune-a").unwrap();
        assert_eq!(tune.kind, "fine_tuned");
        assert_eq!(tune.base_model.as_deref(), Some("base/one"));
        assert!((cache.total_resident_gb() - 4.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_artifact_surfaces_not_found() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        let err = cache.get_model(&ModelName::new("org/ghost-model")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ArtifactNotFound { .. }));
    }

    #[tokio::test]
    async fn unresolved_custom_version_propagates() {
        let (cache, _tmp) = cache_with_probe(Arc::new(AmpleProbe));
        let err = cache.get_model(&ModelName::new("ghost-tune")).await.unwrap_err();
        assert!(matches!(err, GatewayError::VersionUnresolved { .. }));
    }
}
