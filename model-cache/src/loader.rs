//! Weight loading from artifact directories.

use crate::llama::{LlamaModel, ModelArchConfig};
use candle_nn::VarBuilder;
use loragate_hardware::DeviceProfile;
use loragate_values::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// A model built from an artifact directory plus its measured footprint.
pub struct LoadedWeights {
    /// The decoder.
    pub model: LlamaModel,
    /// Measured resident memory in GB.
    pub weights_gb: f64,
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Load model weights from `artifact_dir` at the profile's precision.
pub fn load_model_weights(
    artifact_dir: &Path,
    profile: &DeviceProfile,
    model_id: &str,
) -> GatewayResult<LoadedWeights> {
    let config_path = artifact_dir.join("config.json");
    let config_text = std::fs::read_to_string(&config_path)
        .map_err(|e| load_error(model_id, &format!("cannot read config.json: {e}")))?;
    let config: ModelArchConfig = serde_json::from_str(&config_text)
        .map_err(|e| load_error(model_id, &format!("cannot parse config.json: {e}")))?;

    let shards = find_weight_shards(artifact_dir, model_id)?;
    let shard_bytes: u64 = shards
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    let dtype = profile.precision.dtype();
    info!(
        model = model_id,
        shards = shards.len(),
        dtype = ?dtype,
        layers = config.num_hidden_layers,
        "loading weights"
    );

    // SAFETY: artifact directories are written once by the fine-tune job and
    // never modified while resident.
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&shards, dtype, &profile.device)
            .map_err(|e| load_error(model_id, &format!("cannot mmap weight shards: {e}")))?
    };
    let model = LlamaModel::load(vb, &config)
        .map_err(|e| load_error(model_id, &format!("cannot build model: {e}")))?;

    // Checkpoints ship bf16/f16 shards (2 bytes/param); scale by the target
    // width to approximate the resident footprint.
    let weights_gb =
        shard_bytes as f64 / 1e9 * (profile.precision.bytes_per_param() / 2.0);

    Ok(LoadedWeights { model, weights_gb })
}

/// Collect the safetensors shard files of an artifact, preferring the shard
/// index when present.
fn find_weight_shards(dir: &Path, model_id: &str) -> GatewayResult<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.is_file() {
        let text = std::fs::read_to_string(&index_path)
            .map_err(|e| load_error(model_id, &format!("cannot read shard index: {e}")))?;
        let index: ShardIndex = serde_json::from_str(&text)
            .map_err(|e| load_error(model_id, &format!("cannot parse shard index: {e}")))?;
        let files: BTreeSet<String> = index.weight_map.into_values().collect();
        return Ok(files.into_iter().map(|f| dir.join(f)).collect());
    }

    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| load_error(model_id, &format!("cannot list artifact dir: {e}")))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("model-") && n.ends_with(".safetensors"))
        })
        .collect();
    shards.sort();
    if !shards.is_empty() {
        return Ok(shards);
    }

    if dir.join("pytorch_model.bin").is_file() {
        return Err(load_error(
            model_id,
            "pickled pytorch_model.bin weights are not supported; convert the artifact to safetensors",
        ));
    }
    Err(load_error(model_id, "no weight shards found in artifact directory"))
}

fn load_error(model_id: &str, reason: &str) -> GatewayError {
    GatewayError::LoadFailed { model: model_id.to_string(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, file: &str) {
        std::fs::write(dir.join(file), b"x").unwrap();
    }

    #[test]
    fn shard_index_drives_file_selection() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("model.safetensors.index.json"),
            br#"{"weight_map":{"a":"model-00001-of-00002.safetensors","b":"model-00002-of-00002.safetensors","c":"model-00001-of-00002.safetensors"}}"#,
        )
        .unwrap();
        let shards = find_weight_shards(tmp.path(), "m").unwrap();
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn single_file_fallback() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "model.safetensors");
        let shards = find_weight_shards(tmp.path(), "m").unwrap();
        assert_eq!(shards, vec![tmp.path().join("model.safetensors")]);
    }

    #[test]
    fn bare_shards_are_sorted() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "model-00002-of-00002.safetensors");
        touch(tmp.path(), "model-00001-of-00002.safetensors");
        let shards = find_weight_shards(tmp.path(), "m").unwrap();
        assert!(shards[0].to_string_lossy().contains("00001"));
    }

    #[test]
    fn pickled_weights_are_rejected() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "pytorch_model.bin");
        let err = find_weight_shards(tmp.path(), "m").unwrap_err();
        assert!(err.to_string().contains("safetensors"));
    }
}
