//! Tokenizer loading and the [`TokenizerProfile`].
//!
//! The upstream `tokenizers::Tokenizer` is never mutated; everything the
//! gateway layers on top of it (pad/eos ids, chat template, default stop
//! strings) lives in the profile carried alongside it.

use loragate_values::{GatewayError, GatewayResult};
use serde_json::Value;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Fallback chat template: `Role: content` lines with an `Assistant:`
/// generation cue.
pub const DEFAULT_CHAT_TEMPLATE: &str = "{% for message in messages %}\
{% if message['role'] == 'system' %}{{ message['content'] + '\n\n' }}\
{% elif message['role'] == 'user' %}{{ 'User: ' + message['content'] + '\n' }}\
{% elif message['role'] == 'assistant' %}{{ 'Assistant: ' + message['content'] + '\n' }}\
{% endif %}\
{% endfor %}\
{% if add_generation_prompt %}{{ 'Assistant:' }}{% endif %}";

/// Stop strings used when nothing model-specific can be validated.
pub const LAST_RESORT_STOPS: &[&str] = &["\n\n", "\n"];

/// Everything the gateway configures around a tokenizer without touching it.
#[derive(Debug, Clone)]
pub struct TokenizerProfile {
    /// End-of-sequence token id, if the vocabulary has one.
    pub eos_token_id: Option<u32>,
    /// Padding token id; falls back to eos when the model defines none.
    pub pad_token_id: Option<u32>,
    /// Chat template source (native or [`DEFAULT_CHAT_TEMPLATE`]).
    pub chat_template: String,
    /// Whether the template came from the model itself.
    pub native_chat_template: bool,
    /// Default stop strings, validated against the vocabulary.
    pub stop_tokens: Vec<String>,
    /// Beginning-of-sequence token string, for template context.
    pub bos_token: Option<String>,
    /// End-of-sequence token string, for template context.
    pub eos_token: Option<String>,
}

/// Load `tokenizer.json` from an artifact directory and build its profile.
pub fn load_tokenizer(dir: &Path, model_id: &str) -> GatewayResult<(Tokenizer, TokenizerProfile)> {
    let path = dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&path).map_err(|e| GatewayError::LoadFailed {
        model: model_id.to_string(),
        reason: format!("cannot load tokenizer from {}: {e}", path.display()),
    })?;

    let extras = TokenizerExtras::read(dir);

    let eos_token = extras.eos_token.clone();
    let eos_token_id = eos_token
        .as_deref()
        .and_then(|tok| tokenizer.token_to_id(tok))
        .or_else(|| probe_token_id(&tokenizer, &["<|eot_id|>", "<|endoftext|>", "</s>", "<|im_end|>"]));

    let pad_token_id = extras
        .pad_token
        .as_deref()
        .and_then(|tok| tokenizer.token_to_id(tok))
        .or(eos_token_id);
    if extras.pad_token.is_none() {
        info!(model = model_id, "no pad token defined, using eos as pad");
    }

    let (chat_template, native_chat_template) = match extras.chat_template.clone() {
        Some(template) => (template, true),
        None => {
            info!(model = model_id, "no chat template, installing fallback");
            (DEFAULT_CHAT_TEMPLATE.to_string(), false)
        }
    };

    let candidates = select_stop_tokens(
        &extras.additional_special_tokens,
        &chat_template,
        model_id,
    );
    let stop_tokens = validate_stop_tokens(&tokenizer, candidates, model_id);

    let profile = TokenizerProfile {
        eos_token_id,
        pad_token_id,
        chat_template,
        native_chat_template,
        stop_tokens,
        bos_token: extras.bos_token,
        eos_token,
    };
    debug!(
        model = model_id,
        eos = ?profile.eos_token_id,
        stops = ?profile.stop_tokens,
        "configured tokenizer profile"
    );
    Ok((tokenizer, profile))
}

/// Token metadata read from the sidecar JSON files next to `tokenizer.json`.
#[derive(Debug, Default)]
struct TokenizerExtras {
    chat_template: Option<String>,
    bos_token: Option<String>,
    eos_token: Option<String>,
    pad_token: Option<String>,
    additional_special_tokens: Vec<String>,
}

impl TokenizerExtras {
    fn read(dir: &Path) -> Self {
        let mut extras = Self::default();

        if let Some(config) = read_json(&dir.join("tokenizer_config.json")) {
            extras.chat_template = config
                .get("chat_template")
                .and_then(Value::as_str)
                .map(str::to_string);
            extras.bos_token = token_content(config.get("bos_token"));
            extras.eos_token = token_content(config.get("eos_token"));
            extras.pad_token = token_content(config.get("pad_token"));
        }

        if let Some(map) = read_json(&dir.join("special_tokens_map.json")) {
            if let Some(tokens) = map.get("additional_special_tokens").and_then(Value::as_array) {
                extras.additional_special_tokens = tokens
                    .iter()
                    .filter_map(|t| token_content(Some(t)))
                    .collect();
            }
        }

        extras
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed tokenizer sidecar");
            None
        }
    }
}

/// Token fields are either a bare string or `{ "content": "…" }`.
fn token_content(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn probe_token_id(tokenizer: &Tokenizer, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|tok| tokenizer.token_to_id(tok))
}

/// Pick default stop strings for a model. First match wins:
/// special tokens, then chat-template / name hints, then a generic set.
pub fn select_stop_tokens(
    additional_special_tokens: &[String],
    chat_template: &str,
    model_id: &str,
) -> Vec<String> {
    let from_special: Vec<String> = additional_special_tokens
        .iter()
        .filter(|tok| {
            tok.contains("im_end") || tok.contains("end_of_turn") || tok.as_str() == "</s>"
        })
        .cloned()
        .collect();
    if !from_special.is_empty() {
        return from_special;
    }

    let model_lower = model_id.to_lowercase();
    if chat_template.contains("im_start") || model_lower.contains("qwen") {
        return vec!["<|im_end|>".to_string()];
    }
    if model_lower.contains("gemma") {
        return vec!["<start_of_turn>".to_string(), "<end_of_turn>".to_string()];
    }
    if chat_template.contains("[INST]") || model_lower.contains("llama") {
        return vec!["[/INST]".to_string()];
    }
    let template_lower = chat_template.to_lowercase();
    if template_lower.contains("user")
        && template_lower.contains("assistant")
        && (chat_template.contains("<|user|>") || chat_template.contains("<|assistant|>"))
    {
        return vec!["<|user|>".to_string(), "<|assistant|>".to_string()];
    }

    ["User:", "\nUser:", "\n\nUser:", "user:", "\nuser:"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Drop stop strings the tokenizer cannot encode; fall back to the
/// last-resort set when nothing survives.
pub fn validate_stop_tokens(
    tokenizer: &Tokenizer,
    candidates: Vec<String>,
    model_id: &str,
) -> Vec<String> {
    let mut validated = Vec::new();
    for stop in candidates {
        match tokenizer.encode(stop.as_str(), false) {
            Ok(encoding) if !encoding.get_ids().is_empty() => validated.push(stop),
            _ => warn!(model = model_id, stop = %stop.escape_debug(), "stop token not encodable, skipping"),
        }
    }
    if validated.is_empty() {
        warn!(model = model_id, "no valid stop tokens found, using fallback");
        return LAST_RESORT_STOPS.iter().map(|s| s.to_string()).collect();
    }
    validated
}
