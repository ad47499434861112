//! Resident model cache for the loragate gateway.
//!
//! Keeps a bounded set of base models and LoRA fine-tunes in device/host
//! memory. Base weights are shared: a fine-tuned model is a reference to a
//! resident base plus an owned adapter whose deltas are applied at forward
//! time.

mod cache;
mod llama;
mod loader;
mod lora;
mod tokenizer;

pub use cache::{
    DeviceMemoryProbe, MemoryProbe, ModelCache, ResidentBase, ResidentModel, ResidentModelStats,
};
pub use llama::{KvCache, LlamaModel, ModelArchConfig};
pub use loader::{load_model_weights, LoadedWeights};
pub use lora::{LoraAdapter, LoraDelta};
pub use tokenizer::{
    load_tokenizer, select_stop_tokens, validate_stop_tokens, TokenizerProfile,
    DEFAULT_CHAT_TEMPLATE, LAST_RESORT_STOPS,
};
