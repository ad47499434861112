//! Artifact location and validation.

use crate::gcs::GcsClient;
use common::{GatewayConfig, ModelName};
use dashmap::DashMap;
use loragate_values::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// `training_config.json` as written by the fine-tuning job.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    /// Base model this fine-tune was trained on.
    pub base_model: Option<String>,
    /// Everything else the job recorded (hyperparameters, dataset, …).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

const TRAINING_CONFIG_FILE: &str = "training_config.json";
const ADAPTER_DIR: &str = "adapter";
const MERGED_DIR: &str = "merged";

/// Locates model artifacts: mounted filesystem first, then the local
/// download cache, then a GCS mirror. Read-only from the gateway's
/// perspective.
pub struct ArtifactStore {
    mount_path: Option<PathBuf>,
    prefix: String,
    cache_dir: PathBuf,
    gcs: Option<GcsClient>,
    training_configs: DashMap<String, TrainingConfig>,
}

impl ArtifactStore {
    /// Build the store from gateway configuration. The local cache
    /// directory is created eagerly.
    pub fn new(config: &GatewayConfig, gcs: Option<GcsClient>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.local_model_cache)?;
        if let Some(mount) = &config.mount_path {
            info!(mount = %mount.display(), "artifact mount configured, reading directly when available");
        }
        Ok(Self {
            mount_path: config.mount_path.clone(),
            prefix: config.gcs_model_prefix.clone(),
            cache_dir: config.local_model_cache.clone(),
            gcs,
            training_configs: DashMap::new(),
        })
    }

    /// Object-store prefix for `(name, version)`.
    ///
    /// Custom models with a resolved version live at
    /// `{prefix}{name}/{label}`; everything else at `{prefix}{segment}` with
    /// the namespace separator replaced by a hyphen.
    pub fn object_prefix(&self, name: &ModelName, version: Option<&str>) -> String {
        match version {
            Some(label) if name.is_custom() => format!("{}{}/{}", self.prefix, name, label),
            _ => format!("{}{}", self.prefix, name.storage_segment()),
        }
    }

    /// Local cache directory an artifact mirrors into. Versioned artifacts
    /// map to versioned cache paths so a version switch never serves a stale
    /// mirror.
    pub fn local_dir(&self, name: &ModelName, version: Option<&str>) -> PathBuf {
        match version {
            Some(label) if name.is_custom() => {
                self.cache_dir.join(name.as_str()).join(label)
            }
            _ => self.cache_dir.join(name.storage_segment()),
        }
    }

    fn mount_dir(&self, name: &ModelName, version: Option<&str>) -> Option<PathBuf> {
        let mount = self.mount_path.as_ref()?;
        let prefix = self.prefix.trim_end_matches('/');
        Some(match version {
            Some(label) if name.is_custom() => {
                mount.join(prefix).join(name.as_str()).join(label)
            }
            _ => mount.join(prefix).join(name.storage_segment()),
        })
    }

    /// Resolve an artifact for `(name, version)` to a local filesystem path
    /// containing a valid model directory, mirroring from GCS if needed.
    pub async fn locate(
        &self,
        name: &ModelName,
        version: Option<&str>,
    ) -> GatewayResult<PathBuf> {
        // Mounted volume first: zero-copy reads when the mirror is present.
        if let Some(dir) = self.mount_dir(name, version) {
            if dir.is_dir() {
                let root = resolve_artifact_root(&dir);
                if is_valid_model_dir(&root) {
                    info!(model = %name, path = %root.display(), "using artifact from mounted volume");
                    return Ok(root);
                }
                warn!(model = %name, path = %dir.display(), "mounted artifact failed validation, falling back");
            }
        }

        // Local download cache next.
        let local = self.local_dir(name, version);
        if local.is_dir() {
            let root = resolve_artifact_root(&local);
            if is_valid_model_dir(&root) {
                info!(model = %name, "artifact found in local cache");
                return Ok(root);
            }
            warn!(model = %name, path = %local.display(), "cached artifact failed validation, re-mirroring");
        }

        // Mirror from the object store.
        let object_prefix = self.object_prefix(name, version);
        let Some(gcs) = &self.gcs else {
            return Err(GatewayError::ArtifactNotFound {
                model: name.to_string(),
                location: object_prefix,
            });
        };

        info!(model = %name, prefix = %object_prefix, "mirroring artifact from object store");
        let objects = gcs.list(&object_prefix).await?;
        if objects.is_empty() {
            return Err(GatewayError::ArtifactNotFound {
                model: name.to_string(),
                location: format!("gs://{}/{}", gcs.bucket(), object_prefix),
            });
        }

        if let Err(e) = self.mirror_objects(gcs, &object_prefix, &objects, &local).await {
            // Partial downloads must not poison the cache path.
            let _ = std::fs::remove_dir_all(&local);
            return Err(e);
        }

        let root = resolve_artifact_root(&local);
        if !is_valid_model_dir(&root) {
            let _ = std::fs::remove_dir_all(&local);
            return Err(GatewayError::ArtifactInvalid {
                model: name.to_string(),
                location: root.display().to_string(),
            });
        }
        info!(model = %name, path = %root.display(), "artifact mirrored successfully");
        Ok(root)
    }

    async fn mirror_objects(
        &self,
        gcs: &GcsClient,
        object_prefix: &str,
        objects: &[crate::gcs::GcsObject],
        dest: &Path,
    ) -> GatewayResult<()> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| GatewayError::Internal(format!("cannot create cache dir: {e}")))?;
        for object in objects {
            let relative = object.name[object_prefix.len().min(object.name.len())..]
                .trim_start_matches('/');
            if relative.is_empty() || relative.ends_with('/') {
                continue;
            }
            gcs.download_to(&object.name, &dest.join(relative)).await?;
            debug!(object = %object.name, "mirrored");
        }
        Ok(())
    }

    /// Resolve the adapter subdirectory for a fine-tuned model, mirroring it
    /// from the object store when no local copy exists.
    pub async fn locate_adapter(
        &self,
        name: &ModelName,
        version: Option<&str>,
    ) -> GatewayResult<PathBuf> {
        if let Some(dir) = self.mount_dir(name, version) {
            let adapter = dir.join(ADAPTER_DIR);
            if adapter.is_dir() {
                info!(model = %name, path = %adapter.display(), "adapter found in mounted volume");
                return Ok(adapter);
            }
        }

        let local_adapter = self.local_dir(name, version).join(ADAPTER_DIR);
        if local_adapter.is_dir() {
            info!(model = %name, "adapter found in local cache");
            return Ok(local_adapter);
        }

        let adapter_prefix = format!("{}/{}", self.object_prefix(name, version), ADAPTER_DIR);
        let Some(gcs) = &self.gcs else {
            return Err(GatewayError::ArtifactNotFound {
                model: name.to_string(),
                location: adapter_prefix,
            });
        };

        if !gcs.exists_any(&adapter_prefix).await? {
            return Err(GatewayError::ArtifactNotFound {
                model: name.to_string(),
                location: format!("gs://{}/{}", gcs.bucket(), adapter_prefix),
            });
        }

        let objects = gcs.list(&adapter_prefix).await?;
        if let Err(e) = self.mirror_objects(gcs, &adapter_prefix, &objects, &local_adapter).await
        {
            let _ = std::fs::remove_dir_all(&local_adapter);
            return Err(e);
        }
        info!(model = %name, path = %local_adapter.display(), "adapter mirrored successfully");
        Ok(local_adapter)
    }

    /// Read `training_config.json` for a model: mount first, then local
    /// cache, then a single-object fetch. Found configs are memoized.
    pub async fn read_training_config(
        &self,
        name: &ModelName,
        version: Option<&str>,
    ) -> GatewayResult<Option<TrainingConfig>> {
        let memo_key = format!("{}@{}", name, version.unwrap_or(""));
        if let Some(cached) = self.training_configs.get(&memo_key) {
            debug!(model = %name, "using memoized training config");
            return Ok(Some(cached.clone()));
        }

        if let Some(dir) = self.mount_dir(name, version) {
            let path = dir.join(TRAINING_CONFIG_FILE);
            if path.is_file() {
                let config = parse_training_config(&path, name)?;
                self.training_configs.insert(memo_key, config.clone());
                return Ok(Some(config));
            }
        }

        let local = self.local_dir(name, version).join(TRAINING_CONFIG_FILE);
        if local.is_file() {
            let config = parse_training_config(&local, name)?;
            self.training_configs.insert(memo_key, config.clone());
            return Ok(Some(config));
        }

        if let Some(gcs) = &self.gcs {
            let object =
                format!("{}/{}", self.object_prefix(name, version), TRAINING_CONFIG_FILE);
            if let Some(text) = gcs.fetch_text(&object).await? {
                let config: TrainingConfig = serde_json::from_str(&text).map_err(|e| {
                    GatewayError::Internal(format!("malformed training config for {name}: {e}"))
                })?;
                self.training_configs.insert(memo_key, config.clone());
                return Ok(Some(config));
            }
        }

        debug!(model = %name, "no training config found");
        Ok(None)
    }
}

fn parse_training_config(path: &Path, name: &ModelName) -> GatewayResult<TrainingConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Internal(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| GatewayError::Internal(format!("malformed training config for {name}: {e}")))
}

/// Fine-tune jobs write merged weights under a `merged/` child; when present
/// that child is the artifact root.
pub fn resolve_artifact_root(dir: &Path) -> PathBuf {
    let merged = dir.join(MERGED_DIR);
    if merged.is_dir() {
        merged
    } else {
        dir.to_path_buf()
    }
}

/// A directory is a valid model iff it has `config.json` and at least one
/// weight source: single-file weights, a shard index, or shard files.
pub fn is_valid_model_dir(path: &Path) -> bool {
    if !path.join("config.json").is_file() {
        warn!(path = %path.display(), "validation failed: config.json not found");
        return false;
    }

    let Ok(entries) = std::fs::read_dir(path) else {
        return false;
    };
    let files: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();

    let has_single_file =
        files.iter().any(|f| f == "pytorch_model.bin" || f == "model.safetensors");
    let has_index = files.iter().any(|f| f.ends_with(".index.json"));
    let has_sharded = files.iter().any(|f| {
        (f.starts_with("model-") && f.ends_with(".safetensors"))
            || (f.starts_with("pytorch_model-") && f.ends_with(".bin"))
    });

    let has_weights = has_single_file || has_index || has_sharded;
    if !has_weights {
        warn!(
            path = %path.display(),
            file_count = files.len(),
            "validation failed: no model weight files found"
        );
    }
    has_weights
}
