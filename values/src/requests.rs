//! Request models for the OpenAI-compatible API surface.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A chat message with role and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Message role (`system`, `user`, `assistant`)
    pub role: String,
    /// Message content
    pub content: String,
}

impl Message {
    /// Convenience constructor.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// Stop sequences: OpenAI accepts a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum StopInput {
    /// A single stop string
    One(String),
    /// Multiple stop strings
    Many(Vec<String>),
}

impl StopInput {
    /// Flatten into a list of stop strings.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

/// Prompt input for text completions: a single string or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum PromptInput {
    /// A single prompt
    Text(String),
    /// A batch of prompts (only single-element batches are accepted)
    Batch(Vec<String>),
}

/// Request for chat completion (OpenAI compatible).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    /// Model identifier
    pub model: String,
    /// Conversation messages
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 to 2.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Enable server-sent-event streaming
    #[serde(default)]
    pub stream: bool,
    /// Nucleus sampling probability mass
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Stop sequences (string or array)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopInput>,
}

/// Request for text completion (OpenAI compatible).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompletionRequest {
    /// Model identifier
    pub model: String,
    /// Prompt text (string or single-element array)
    pub prompt: PromptInput,
    /// Sampling temperature (0.0 to 2.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Enable server-sent-event streaming
    #[serde(default)]
    pub stream: bool,
    /// Nucleus sampling probability mass
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Stop sequences (string or array)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopInput>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> usize {
    512
}

fn default_top_p() -> f32 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_defaults() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"assistant-v1","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(req.temperature, 0.7);
        assert_eq!(req.max_tokens, 512);
        assert_eq!(req.top_p, 1.0);
        assert!(!req.stream);
        assert!(req.stop.is_none());
    }

    #[test]
    fn stop_accepts_string_or_array() {
        let one: StopInput = serde_json::from_str(r#""\n\nUser:""#).unwrap();
        assert_eq!(one.into_vec(), vec!["\n\nUser:".to_string()]);

        let many: StopInput = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(many.into_vec(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn prompt_accepts_string_or_array() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"model":"m","prompt":["only"]}"#).unwrap();
        match req.prompt {
            PromptInput::Batch(v) => assert_eq!(v.len(), 1),
            _ => panic!("expected batch"),
        }
    }
}
