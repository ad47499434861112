//! Response models for the OpenAI-compatible API surface.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::requests::Message;

/// Token usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: usize,
    /// Tokens generated
    pub completion_tokens: usize,
    /// Prompt + completion
    pub total_tokens: usize,
}

impl Usage {
    /// Build usage from prompt/completion counts.
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens }
    }
}

/// A single chat completion choice.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatChoice {
    /// Choice index
    pub index: u32,
    /// The assistant message
    pub message: Message,
    /// Why generation stopped
    pub finish_reason: String,
}

/// Response for chat completion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionResponse {
    /// Response id (`chatcmpl-…`)
    pub id: String,
    /// Always `chat.completion`
    pub object: String,
    /// Creation unix timestamp
    pub created: i64,
    /// Model that produced the response
    pub model: String,
    /// Completion choices
    pub choices: Vec<ChatChoice>,
    /// Token accounting
    pub usage: Usage,
}

impl ChatCompletionResponse {
    /// Single-choice chat response with `finish_reason: "stop"`.
    pub fn stop(id: String, model: String, content: String, usage: Usage) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            created: crate::unix_now(),
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: Message::new("assistant", content),
                finish_reason: "stop".to_string(),
            }],
            usage,
        }
    }
}

/// Delta payload inside a streaming chat chunk. The first content frame
/// carries the role, subsequent frames only content, the terminal frame
/// neither.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ChatDelta {
    /// `assistant` on the first frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Text fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// A single streaming chat choice.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamChoice {
    /// Choice index
    pub index: u32,
    /// Delta payload
    pub delta: ChatDelta,
    /// Set to `stop` on the terminal frame
    pub finish_reason: Option<String>,
}

/// A chunk of streaming chat completion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionChunk {
    /// Response id, stable across the stream
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Creation unix timestamp
    pub created: i64,
    /// Model that produced the chunk
    pub model: String,
    /// Streaming choices
    pub choices: Vec<StreamChoice>,
}

impl ChatCompletionChunk {
    /// Content frame; `first` controls whether the role is attached.
    pub fn content(id: &str, model: &str, text: &str, first: bool) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: crate::unix_now(),
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: ChatDelta {
                    role: first.then(|| "assistant".to_string()),
                    content: Some(text.to_string()),
                },
                finish_reason: None,
            }],
        }
    }

    /// Terminal frame with `finish_reason: "stop"` and an empty delta.
    pub fn finish(id: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: crate::unix_now(),
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: ChatDelta::default(),
                finish_reason: Some("stop".to_string()),
            }],
        }
    }
}

/// A single text completion choice.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompletionChoice {
    /// Choice index
    pub index: u32,
    /// Generated text
    pub text: String,
    /// Why generation stopped
    pub finish_reason: String,
}

/// Response for text completion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompletionResponse {
    /// Response id (`cmpl-…`)
    pub id: String,
    /// Always `text_completion`
    pub object: String,
    /// Creation unix timestamp
    pub created: i64,
    /// Model that produced the response
    pub model: String,
    /// Completion choices
    pub choices: Vec<CompletionChoice>,
    /// Token accounting
    pub usage: Usage,
}

impl CompletionResponse {
    /// Single-choice text response with `finish_reason: "stop"`.
    pub fn stop(id: String, model: String, text: String, usage: Usage) -> Self {
        Self {
            id,
            object: "text_completion".to_string(),
            created: crate::unix_now(),
            model,
            choices: vec![CompletionChoice { index: 0, text, finish_reason: "stop".to_string() }],
            usage,
        }
    }
}

/// A single streaming text completion choice.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamCompletionChoice {
    /// Choice index
    pub index: u32,
    /// Text fragment
    pub text: String,
    /// Set to `stop` on the terminal frame
    pub finish_reason: Option<String>,
}

/// A chunk of streaming text completion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompletionChunk {
    /// Response id, stable across the stream
    pub id: String,
    /// Always `text_completion.chunk`
    pub object: String,
    /// Creation unix timestamp
    pub created: i64,
    /// Model that produced the chunk
    pub model: String,
    /// Streaming choices
    pub choices: Vec<StreamCompletionChoice>,
}

impl CompletionChunk {
    /// Content frame.
    pub fn content(id: &str, model: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "text_completion.chunk".to_string(),
            created: crate::unix_now(),
            model: model.to_string(),
            choices: vec![StreamCompletionChoice {
                index: 0,
                text: text.to_string(),
                finish_reason: None,
            }],
        }
    }

    /// Terminal frame with `finish_reason: "stop"` and empty text.
    pub fn finish(id: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "text_completion.chunk".to_string(),
            created: crate::unix_now(),
            model: model.to_string(),
            choices: vec![StreamCompletionChoice {
                index: 0,
                text: String::new(),
                finish_reason: Some("stop".to_string()),
            }],
        }
    }
}

/// Information about a resident model.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    /// Model identifier
    pub id: String,
    /// Always `model`
    pub object: String,
    /// Unix timestamp the entry was produced at
    pub created: i64,
    /// Owning organization
    pub owned_by: String,
}

impl ModelInfo {
    /// Build an entry for the `/v1/models` listing.
    pub fn resident(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created: crate::unix_now(),
            owned_by: "organization".to_string(),
        }
    }
}

/// List of resident models (OpenAI list envelope).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelListResponse {
    /// Always `list`
    pub object: String,
    /// Resident models
    pub data: Vec<ModelInfo>,
}

impl ModelListResponse {
    /// Wrap a listing in the OpenAI envelope.
    pub fn new(data: Vec<ModelInfo>) -> Self {
        Self { object: "list".to_string(), data }
    }
}
