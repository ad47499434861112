//! Typed value layer for the loragate gateway.
//!
//! This crate sits at the bottom of the workspace dependency hierarchy and
//! provides the OpenAI-compatible request/response shapes, the gateway-wide
//! error taxonomy, and the authentication context that flows from the auth
//! gate into the inference engine. It has no dependencies on other workspace
//! crates so every layer can share these types without cycles.

mod auth;
mod error;
mod requests;
mod responses;

pub use auth::{AuthContext, KeyRecord, KeyType};
pub use error::{GatewayError, GatewayResult};
pub use requests::{
    ChatCompletionRequest, CompletionRequest, Message, PromptInput, StopInput,
};
pub use responses::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatDelta, CompletionChoice,
    CompletionChunk, CompletionResponse, ModelInfo, ModelListResponse, StreamChoice,
    StreamCompletionChoice, Usage,
};

/// Generate an OpenAI-style request id with the given prefix
/// (e.g. `chatcmpl-1f0c9a2b44d1`).
pub fn request_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..12])
}

/// Current unix timestamp in seconds, as used in the `created` fields.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
