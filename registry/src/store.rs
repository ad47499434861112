//! The metadata-store trait and its in-memory double.

use async_trait::async_trait;
use loragate_values::KeyRecord;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Transport-level metadata-store failures. Missing documents are `Ok(None)`,
/// not errors; upstream decides what absence means.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("metadata store transport error: {0}")]
    Transport(String),
    /// The store answered with something unparseable.
    #[error("metadata store returned malformed data: {0}")]
    Decode(String),
}

/// A custom-model document.
#[derive(Debug, Clone)]
pub struct ModelDoc {
    /// Store-side document id (full resource path for Firestore).
    pub doc_id: String,
    /// Logical model name.
    pub name: String,
    /// Pointer to the active version subdocument, if one is set.
    pub active_version_id: Option<String>,
}

/// A version subdocument.
#[derive(Debug, Clone)]
pub struct VersionDoc {
    /// Human-facing version label (`v1`, `v2`, …), if set.
    pub version_label: Option<String>,
}

/// Read access to the metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Find the model document for a custom model name.
    async fn find_model(&self, name: &str) -> Result<Option<ModelDoc>, StoreError>;

    /// Fetch a version subdocument of a model document.
    async fn get_version(
        &self,
        model_doc_id: &str,
        version_id: &str,
    ) -> Result<Option<VersionDoc>, StoreError>;

    /// Find an active API key by its SHA-256 hash.
    async fn find_active_key(&self, key_hash: &str) -> Result<Option<KeyRecord>, StoreError>;
}

/// In-memory metadata store used by tests and local development.
///
/// Counts queries so tests can assert cache behavior (at most one store
/// query per TTL window, fresh query after invalidation).
#[derive(Default)]
pub struct MemoryStore {
    models: RwLock<HashMap<String, ModelDoc>>,
    versions: RwLock<HashMap<(String, String), VersionDoc>>,
    keys: RwLock<HashMap<String, KeyRecord>>,
    model_queries: AtomicUsize,
    key_queries: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model with an active version pointer.
    pub fn insert_model(&self, name: &str, active_version_id: Option<&str>) {
        self.models.write().insert(
            name.to_string(),
            ModelDoc {
                doc_id: format!("models/{name}"),
                name: name.to_string(),
                active_version_id: active_version_id.map(str::to_string),
            },
        );
    }

    /// Register a version subdocument under a model.
    pub fn insert_version(&self, model_name: &str, version_id: &str, label: Option<&str>) {
        self.versions.write().insert(
            (format!("models/{model_name}"), version_id.to_string()),
            VersionDoc { version_label: label.map(str::to_string) },
        );
    }

    /// Register an API key record, keyed by its hash.
    pub fn insert_key(&self, record: KeyRecord) {
        self.keys.write().insert(record.key_hash.clone(), record);
    }

    /// How many model lookups hit the store.
    pub fn model_queries(&self) -> usize {
        self.model_queries.load(Ordering::SeqCst)
    }

    /// How many key lookups hit the store.
    pub fn key_queries(&self) -> usize {
        self.key_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn find_model(&self, name: &str) -> Result<Option<ModelDoc>, StoreError> {
        self.model_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.models.read().get(name).cloned())
    }

    async fn get_version(
        &self,
        model_doc_id: &str,
        version_id: &str,
    ) -> Result<Option<VersionDoc>, StoreError> {
        Ok(self
            .versions
            .read()
            .get(&(model_doc_id.to_string(), version_id.to_string()))
            .cloned())
    }

    async fn find_active_key(&self, key_hash: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.key_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.keys.read().get(key_hash).filter(|k| k.is_active).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loragate_values::KeyType;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.insert_model("assistant-v1", Some("ver_1"));
        store.insert_version("assistant-v1", "ver_1", Some("v3"));

        let model = store.find_model("assistant-v1").await.unwrap().unwrap();
        assert_eq!(model.active_version_id.as_deref(), Some("ver_1"));

        let version =
            store.get_version(&model.doc_id, "ver_1").await.unwrap().unwrap();
        assert_eq!(version.version_label.as_deref(), Some("v3"));
        assert_eq!(store.model_queries(), 1);
    }

    #[tokio::test]
    async fn inactive_keys_are_not_returned() {
        let store = MemoryStore::new();
        store.insert_key(KeyRecord {
            key_id: "k1".into(),
            key_hash: "hash".into(),
            is_active: false,
            expires_at: None,
            model_name: "*".into(),
            user_id: None,
            key_type: KeyType::User,
        });
        assert!(store.find_active_key("hash").await.unwrap().is_none());
    }
}
