//! Logical model identifiers.
//!
//! Two shapes exist and a name is always exactly one of them:
//! - *base* identifiers contain a namespace separator
//!   (`meta-llama/Llama-3.2-1B`) and resolve to a fixed artifact directory;
//! - *custom* identifiers are bare (`assistant-v1`) and are versioned through
//!   the metadata store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical model name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelName(String);

impl ModelName {
    /// Wrap a raw identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base identifiers carry a namespace separator and are never versioned.
    pub fn is_base(&self) -> bool {
        self.0.contains('/')
    }

    /// Custom identifiers are bare names versioned via the metadata store.
    pub fn is_custom(&self) -> bool {
        !self.is_base()
    }

    /// Object-store directory segment: the separator is replaced by a hyphen
    /// so `meta-llama/Llama-3.2-1B` lands under `meta-llama-Llama-3.2-1B`.
    pub fn storage_segment(&self) -> String {
        self.0.replace('/', "-")
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ModelName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ModelName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
