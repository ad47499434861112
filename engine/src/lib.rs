//! Inference engine for the loragate gateway.
//!
//! Runs chat and text completion requests against resident models from the
//! model cache: prompt construction, the autoregressive generation loop on
//! a dedicated worker thread, stop-sequence enforcement at both the token
//! and the text layer, SSE chunk framing, and GPU-fault recovery.

mod engine;
mod logits;
mod params;
mod prompt;
mod splice;
mod stopping;
mod stream;
mod worker;

pub use engine::{
    effective_stops, encode_stop_sequences, strip_stop_strings, ChatOutcome, CompletionOutcome,
    FrameReceiver, InferenceEngine,
};
pub use logits::{sanitize_logits, LOGIT_CLAMP};
pub use params::GenerationParams;
pub use prompt::{build_chat_prompt, fallback_prompt};
pub use splice::{SplicedChunk, StreamSplicer};
pub use stopping::StopOnTokens;
pub use stream::TokenStream;
pub use worker::{
    classify_device_error, join_worker, spawn_generation, WorkerBridge, WorkerEvent,
    JOIN_DEADLINE,
};
