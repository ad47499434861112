//! Memory probing and model-size estimation.

use crate::device::{DeviceKind, Precision};
use regex::Regex;
use std::process::Command;
use std::sync::LazyLock;
use tracing::debug;

/// Which pool a memory reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    /// Accelerator memory
    Gpu,
    /// Host memory
    System,
}

/// Extra memory beyond raw parameter bytes: activations, KV cache and
/// framework overhead.
const OVERHEAD_FACTOR: f64 = 1.2;

/// Conservative parameter count assumed when the identifier gives no hint.
const DEFAULT_PARAM_BILLIONS: f64 = 7.0;

static RE_BILLIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.?\d*)b").expect("valid billions pattern"));
static RE_MILLIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.?\d*)m").expect("valid millions pattern"));

/// Free accelerator memory in GB via `nvidia-smi`, if an NVIDIA GPU is
/// visible. lspci-class probing is pointless here: only a device the
/// driver reports can back a candle CUDA context.
pub fn available_gpu_memory_gb() -> Option<f64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let free_mb: f64 = stdout.lines().next()?.trim().parse().ok()?;
    let free_gb = free_mb / 1024.0;
    debug!(free_gb, "probed free GPU memory via nvidia-smi");
    Some(free_gb)
}

/// Free host memory in GB.
pub fn available_system_memory_gb() -> f64 {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory() as f64 / 1024.0 / 1024.0 / 1024.0
}

/// Free memory for the given device class plus which pool it came from.
///
/// Accelerator memory when a GPU is present, host memory otherwise. Metal
/// shares host memory, so the system reading stands in for it.
pub fn available_memory(kind: DeviceKind) -> (f64, MemorySource) {
    if kind == DeviceKind::Cuda {
        if let Some(gb) = available_gpu_memory_gb() {
            return (gb, MemorySource::Gpu);
        }
    }
    (available_system_memory_gb(), MemorySource::System)
}

/// Parse a parameter count in billions out of a model identifier.
///
/// Recognizes `8B`/`8b` (billions) and `270M`/`270m` (millions), with an
/// optional decimal part. Returns `None` when the identifier gives no hint.
pub fn parse_param_billions(model_id: &str) -> Option<f64> {
    let lower = model_id.to_lowercase();
    if let Some(caps) = RE_BILLIONS.captures(&lower) {
        return caps[1].parse().ok();
    }
    if let Some(caps) = RE_MILLIONS.captures(&lower) {
        let millions: f64 = caps[1].parse().ok()?;
        return Some(millions / 1000.0);
    }
    None
}

/// Estimate required memory in GB for loading `model_id` at `precision`.
pub fn estimate_model_memory_gb(model_id: &str, precision: Precision) -> f64 {
    let params = parse_param_billions(model_id).unwrap_or_else(|| {
        debug!(
            model_id,
            "could not determine parameter count, assuming {DEFAULT_PARAM_BILLIONS}B"
        );
        DEFAULT_PARAM_BILLIONS
    });
    params * precision.bytes_per_param() * OVERHEAD_FACTOR
}

/// Human-readable memory size.
pub fn format_memory_size(size_gb: f64) -> String {
    if size_gb >= 1.0 {
        format!("{size_gb:.2}GB")
    } else {
        format!("{:.2}MB", size_gb * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_billions() {
        assert_eq!(parse_param_billions("meta-llama/Llama-3.1-8B"), Some(8.0));
        assert_eq!(parse_param_billions("mistral-7b-instruct"), Some(7.0));
        assert_eq!(parse_param_billions("Qwen2.5-0.5B"), Some(0.5));
    }

    #[test]
    fn parses_millions() {
        assert_eq!(parse_param_billions("gemma-2-270m"), Some(0.27));
        assert_eq!(parse_param_billions("smol-135M"), Some(0.135));
    }

    #[test]
    fn unknown_names_give_no_hint() {
        assert_eq!(parse_param_billions("assistant"), None);
    }

    #[test]
    fn estimate_uses_default_for_unknown() {
        let est = estimate_model_memory_gb("assistant", Precision::Bf16);
        assert!((est - 7.0 * 2.0 * 1.2).abs() < 1e-9);
    }

    #[test]
    fn estimate_scales_with_precision() {
        let bf16 = estimate_model_memory_gb("Llama-3.1-8B", Precision::Bf16);
        let fp32 = estimate_model_memory_gb("Llama-3.1-8B", Precision::Fp32);
        assert!((bf16 - 8.0 * 2.0 * 1.2).abs() < 1e-9);
        assert!((fp32 - 2.0 * bf16).abs() < 1e-9);
    }

    #[test]
    fn formats_gb_and_mb() {
        assert_eq!(format_memory_size(1.5), "1.50GB");
        assert_eq!(format_memory_size(0.5), "512.00MB");
    }

    #[test]
    fn system_memory_is_positive() {
        assert!(available_system_memory_gb() > 0.0);
    }
}
