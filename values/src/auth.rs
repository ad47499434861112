//! Authentication context and key records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// The static base-model key or a key minted for base-model access.
    Base,
    /// A key minted for a specific fine-tuned model (or `*`).
    User,
}

/// An API key record as stored in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Store document id
    pub key_id: String,
    /// SHA-256 hex of the raw bearer token
    pub key_hash: String,
    /// Inactive keys never authenticate
    pub is_active: bool,
    /// Optional expiry; a past timestamp rejects the key
    pub expires_at: Option<DateTime<Utc>>,
    /// The model this key is scoped to, or `*` for all models
    pub model_name: String,
    /// Owning user, if any
    pub user_id: Option<String>,
    /// Key kind
    pub key_type: KeyType,
}

impl KeyRecord {
    /// Whether the key's expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Whether the key may access `model`.
    pub fn allows_model(&self, model: &str) -> bool {
        self.model_name == "*" || self.model_name == model
    }
}

/// Authentication context attached to every request after the auth gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Whether a credential was actually verified
    pub authenticated: bool,
    /// Model scope of the credential (`*` or a model name); `None` for
    /// unauthenticated contexts
    pub model_scope: Option<String>,
    /// Owning user of the key
    pub user_id: Option<String>,
    /// Store id of the key document
    pub key_id: Option<String>,
    /// Model name taken from the URL path, when present
    pub requested_model: Option<String>,
}

impl AuthContext {
    /// Context for public routes (no auth attempted).
    pub fn public() -> Self {
        Self {
            authenticated: false,
            model_scope: None,
            user_id: None,
            key_id: None,
            requested_model: None,
        }
    }

    /// Synthetic context attached when auth is globally disabled.
    pub fn local_dev(requested_model: Option<String>) -> Self {
        Self {
            authenticated: false,
            model_scope: None,
            user_id: None,
            key_id: None,
            requested_model,
        }
    }

    /// Context for the configured static base-model key.
    pub fn base_key(requested_model: Option<String>) -> Self {
        Self {
            authenticated: true,
            model_scope: Some("*".to_string()),
            user_id: None,
            key_id: Some("base_static_key".to_string()),
            requested_model,
        }
    }

    /// Context built from a verified key record.
    pub fn from_key(record: &KeyRecord, requested_model: Option<String>) -> Self {
        Self {
            authenticated: true,
            model_scope: Some(record.model_name.clone()),
            user_id: record.user_id.clone(),
            key_id: Some(record.key_id.clone()),
            requested_model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(model: &str, expires_in: Option<i64>) -> KeyRecord {
        KeyRecord {
            key_id: "k1".into(),
            key_hash: "h".into(),
            is_active: true,
            expires_at: expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            model_name: model.into(),
            user_id: Some("u1".into()),
            key_type: KeyType::User,
        }
    }

    #[test]
    fn wildcard_key_allows_everything() {
        let key = record("*", None);
        assert!(key.allows_model("assistant-v1"));
        assert!(key.allows_model("meta-llama/Llama-3.2-1B"));
    }

    #[test]
    fn scoped_key_allows_only_its_model() {
        let key = record("assistant-v1", None);
        assert!(key.allows_model("assistant-v1"));
        assert!(!key.allows_model("other-model"));
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let fresh = record("*", Some(3600));
        assert!(!fresh.is_expired(Utc::now()));
        let stale = record("*", Some(-3600));
        assert!(stale.is_expired(Utc::now()));
        let never = record("*", None);
        assert!(!never.is_expired(Utc::now()));
    }
}
