//! LoRA adapter loading and application.
//!
//! An adapter directory holds `adapter_config.json` (rank, alpha, target
//! modules) and an `adapter_model.safetensors` with `lora_A`/`lora_B` pairs
//! per targeted projection. Deltas are applied at forward time as
//! `y = base(x) + (x·Aᵀ)·Bᵀ · alpha/r`, so the base weights are shared
//! across every fine-tune composed on them.

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use loragate_values::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

#[derive(Debug, Deserialize)]
struct AdapterConfigFile {
    r: usize,
    lora_alpha: f64,
    #[serde(default)]
    #[allow(dead_code)]
    target_modules: Vec<String>,
}

/// One low-rank delta: `A` is `(r, in)`, `B` is `(out, r)`.
#[derive(Debug)]
pub struct LoraDelta {
    a: Tensor,
    b: Tensor,
    scale: f64,
}

impl LoraDelta {
    /// Build a delta from raw tensors. Test seam.
    #[cfg(test)]
    pub(crate) fn from_parts(a: Tensor, b: Tensor, scale: f64) -> Self {
        Self { a, b, scale }
    }

    /// Add this delta to a base projection output.
    pub fn apply(&self, xs: &Tensor, base: &Tensor) -> CandleResult<Tensor> {
        let low = xs.broadcast_matmul(&self.a.t()?)?;
        let delta = low.broadcast_matmul(&self.b.t()?)?;
        base + (delta * self.scale)?
    }
}

/// A loaded LoRA adapter: deltas keyed by `(layer, module)`.
#[derive(Debug)]
pub struct LoraAdapter {
    deltas: HashMap<(usize, String), LoraDelta>,
    /// Measured adapter memory in GB.
    pub memory_gb: f64,
}

impl LoraAdapter {
    /// Load an adapter directory onto `device` at `dtype`.
    pub fn load(dir: &Path, device: &Device, dtype: DType) -> GatewayResult<Self> {
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let config: AdapterConfigFile = std::fs::read_to_string(&config_path)
            .map_err(|e| load_error(dir, &format!("cannot read {ADAPTER_CONFIG_FILE}: {e}")))
            .and_then(|text| {
                serde_json::from_str(&text).map_err(|e| {
                    load_error(dir, &format!("malformed {ADAPTER_CONFIG_FILE}: {e}"))
                })
            })?;
        if config.r == 0 {
            return Err(load_error(dir, "adapter rank must be non-zero"));
        }
        let scale = config.lora_alpha / config.r as f64;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .map_err(|e| load_error(dir, &format!("cannot load adapter weights: {e}")))?;

        let mut halves: HashMap<(usize, String), (Option<Tensor>, Option<Tensor>)> =
            HashMap::new();
        let mut total_bytes = 0usize;
        for (name, tensor) in tensors {
            let Some((layer, module, is_a)) = parse_delta_name(&name) else {
                debug!(tensor = %name, "skipping unrecognized adapter tensor");
                continue;
            };
            total_bytes += tensor.elem_count() * tensor.dtype().size_in_bytes();
            let tensor = tensor
                .to_dtype(dtype)
                .map_err(|e| load_error(dir, &format!("cannot convert {name}: {e}")))?;
            let slot = halves.entry((layer, module)).or_insert((None, None));
            if is_a {
                slot.0 = Some(tensor);
            } else {
                slot.1 = Some(tensor);
            }
        }

        let mut deltas = HashMap::new();
        for ((layer, module), (a, b)) in halves {
            match (a, b) {
                (Some(a), Some(b)) => {
                    deltas.insert((layer, module), LoraDelta { a, b, scale });
                }
                _ => {
                    return Err(load_error(
                        dir,
                        &format!("layer {layer} module {module} is missing its lora_A/lora_B pair"),
                    ))
                }
            }
        }
        if deltas.is_empty() {
            return Err(load_error(dir, "adapter contains no lora_A/lora_B tensor pairs"));
        }

        let memory_gb = total_bytes as f64 / 1e9;
        info!(
            path = %dir.display(),
            modules = deltas.len(),
            rank = config.r,
            memory_gb,
            "loaded LoRA adapter"
        );
        Ok(Self { deltas, memory_gb })
    }

    /// Assemble an adapter from pre-built deltas. Test seam.
    #[cfg(test)]
    pub(crate) fn from_parts(
        deltas: HashMap<(usize, String), LoraDelta>,
        memory_gb: f64,
    ) -> Self {
        Self { deltas, memory_gb }
    }

    /// The delta for a `(layer, module)` projection, if targeted.
    pub fn delta(&self, layer: usize, module: &str) -> Option<&LoraDelta> {
        self.deltas.get(&(layer, module.to_string()))
    }

    /// Number of targeted projections.
    pub fn module_count(&self) -> usize {
        self.deltas.len()
    }
}

fn load_error(dir: &Path, reason: &str) -> GatewayError {
    GatewayError::LoadFailed {
        model: dir.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a PEFT tensor name like
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight` into
/// `(layer, module, is_a)`.
fn parse_delta_name(name: &str) -> Option<(usize, String, bool)> {
    let parts: Vec<&str> = name.split('.').collect();
    let layers_idx = parts.iter().position(|p| *p == "layers")?;
    let layer: usize = parts.get(layers_idx + 1)?.parse().ok()?;
    let lora_idx = parts.iter().position(|p| *p == "lora_A" || *p == "lora_B")?;
    let module = (*parts.get(lora_idx - 1)?).to_string();
    let is_a = parts[lora_idx] == "lora_A";
    Some((layer, module, is_a))
}
