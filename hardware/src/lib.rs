//! Hardware detection for the loragate gateway.
//!
//! Picks the accelerator device and numeric precision models are loaded at,
//! and answers "how much memory is free right now" for the cache's eviction
//! decisions.

pub mod device;
pub mod memory;

pub use device::{DeviceKind, DeviceProfile, Precision};
pub use memory::{
    available_memory, available_system_memory_gb, estimate_model_memory_gb, format_memory_size,
    parse_param_billions, MemorySource,
};
