//! Incremental detokenization.
//!
//! Byte-level BPE tokenizers cannot decode one token at a time without
//! producing replacement characters mid-merge. The decode window keeps a
//! running span and only emits the suffix once it ends on a clean,
//! alphanumeric boundary; `decode_rest` flushes whatever remains.

use loragate_values::{GatewayError, GatewayResult};
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Streams decoded text out of a growing token sequence.
pub struct TokenStream {
    tokenizer: Arc<Tokenizer>,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenStream {
    /// Fresh stream over generated tokens (prompt excluded).
    pub fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self { tokenizer, tokens: Vec::new(), prev_index: 0, current_index: 0 }
    }

    fn decode(&self, tokens: &[u32]) -> GatewayResult<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| GatewayError::Internal(format!("decode failed: {e}")))
    }

    /// Feed the next generated token; returns newly decodable text, if any.
    pub fn next_token(&mut self, token: u32) -> GatewayResult<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len()
            && text.is_char_boundary(prev_text.len())
            && text.chars().last().is_some_and(|c| c.is_alphanumeric())
        {
            let emitted = text[prev_text.len()..].to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(emitted))
        } else {
            Ok(None)
        }
    }

    /// Flush any text still held back at end of generation.
    pub fn decode_rest(&self) -> GatewayResult<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() && text.is_char_boundary(prev_text.len()) {
            Ok(Some(text[prev_text.len()..].to_string()))
        } else {
            Ok(None)
        }
    }

    /// Generated tokens so far.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}
