//! Device and precision selection.

use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Which accelerator class the process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// NVIDIA GPU
    Cuda,
    /// Apple accelerator
    Metal,
    /// Host CPU
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Numeric precision weights are loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// bfloat16: fp16 footprint with fp32 exponent range
    Bf16,
    /// float32
    Fp32,
}

impl Precision {
    /// The candle dtype for this precision.
    pub fn dtype(self) -> DType {
        match self {
            Self::Bf16 => DType::BF16,
            Self::Fp32 => DType::F32,
        }
    }

    /// Bytes per parameter at this precision.
    pub fn bytes_per_param(self) -> f64 {
        match self {
            Self::Bf16 => 2.0,
            Self::Fp32 => 4.0,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bf16 => write!(f, "bf16"),
            Self::Fp32 => write!(f, "fp32"),
        }
    }
}

/// The resolved device plus the precision policy for it.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// The candle device handle.
    pub device: Device,
    /// Which accelerator class it is.
    pub kind: DeviceKind,
    /// Precision weights are loaded at on this device.
    pub precision: Precision,
}

impl DeviceProfile {
    /// Detect the best available device.
    ///
    /// Precision is deterministic per device class: CUDA uses bf16 when the
    /// device supports it (fp16 footprint, fp32 exponent range, avoids the
    /// inf/nan sampling failures seen with fp16), otherwise fp32; Metal and
    /// CPU use fp32.
    pub fn detect() -> Self {
        match Device::new_cuda(0) {
            Ok(device) => {
                let precision = if supports_bf16(&device) {
                    Precision::Bf16
                } else {
                    warn!("CUDA device lacks bf16 support, falling back to fp32");
                    Precision::Fp32
                };
                info!(precision = %precision, "using CUDA device");
                return Self { device, kind: DeviceKind::Cuda, precision };
            }
            Err(_) => {}
        }
        match Device::new_metal(0) {
            Ok(device) => {
                info!("using Metal device (fp32 for numerical stability)");
                return Self { device, kind: DeviceKind::Metal, precision: Precision::Fp32 };
            }
            Err(_) => {}
        }
        info!("no accelerator found, using CPU (fp32)");
        Self { device: Device::Cpu, kind: DeviceKind::Cpu, precision: Precision::Fp32 }
    }

    /// Profile pinned to the CPU, used by tests and local tooling.
    pub fn cpu() -> Self {
        Self { device: Device::Cpu, kind: DeviceKind::Cpu, precision: Precision::Fp32 }
    }

    /// Release cached device buffers after entries have been dropped.
    ///
    /// candle frees tensor memory when the owning entries drop; synchronizing
    /// here makes sure those frees have landed before memory is re-probed.
    pub fn release_device_cache(&self) {
        if let Err(e) = self.device.synchronize() {
            warn!(error = %e, "device synchronize failed while releasing cache");
        }
    }
}

/// Probe bf16 support by materializing a tiny tensor.
fn supports_bf16(device: &Device) -> bool {
    Tensor::zeros((1,), DType::BF16, device).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_profile_is_fp32() {
        let profile = DeviceProfile::cpu();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert_eq!(profile.precision, Precision::Fp32);
        assert_eq!(profile.precision.dtype(), DType::F32);
    }

    #[test]
    fn precision_byte_widths() {
        assert_eq!(Precision::Bf16.bytes_per_param(), 2.0);
        assert_eq!(Precision::Fp32.bytes_per_param(), 4.0);
    }

    #[test]
    fn detect_never_panics() {
        // On machines without accelerators this must settle on the CPU.
        let profile = DeviceProfile::detect();
        profile.release_device_cache();
    }
}
