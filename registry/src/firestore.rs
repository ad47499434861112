//! Firestore REST client for the metadata store.
//!
//! Talks to the Firestore v1 REST API directly: `runQuery` for filtered
//! lookups and plain document GETs for subdocuments. Honors
//! `FIRESTORE_EMULATOR_HOST` and authenticates with metadata-server tokens
//! when running inside GCP.

use crate::store::{MetadataStore, ModelDoc, StoreError, VersionDoc};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MetadataTokenProvider;
use loragate_values::{KeyRecord, KeyType};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Firestore-backed metadata store.
pub struct FirestoreStore {
    client: reqwest::Client,
    token: Arc<MetadataTokenProvider>,
    /// `{base_url}/projects/{project}/databases/(default)/documents`
    documents_root: String,
    base_url: String,
}

impl FirestoreStore {
    /// Client for the given project. When `FIRESTORE_EMULATOR_HOST` is set
    /// the emulator endpoint is used and requests go unauthenticated.
    pub fn new(project: &str, token: Arc<MetadataTokenProvider>) -> Self {
        let base_url = match std::env::var("FIRESTORE_EMULATOR_HOST") {
            Ok(host) if !host.is_empty() => format!("http://{host}/v1"),
            _ => "https://firestore.googleapis.com/v1".to_string(),
        };
        let documents_root =
            format!("{base_url}/projects/{project}/databases/(default)/documents");
        Self { client: reqwest::Client::new(), token, documents_root, base_url }
    }

    async fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// POST a structured query against a top-level collection and return the
    /// first matching document, if any.
    async fn run_query(&self, query: Value) -> Result<Option<Value>, StoreError> {
        let url = format!("{}:runQuery", self.documents_root);
        let request = self.client.post(&url).json(&json!({ "structuredQuery": query }));
        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Transport(format!(
                "runQuery returned HTTP {}",
                response.status()
            )));
        }

        let rows: Vec<Value> =
            response.json().await.map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(rows.into_iter().find_map(|row| row.get("document").cloned()))
    }
}

#[async_trait]
impl MetadataStore for FirestoreStore {
    async fn find_model(&self, name: &str) -> Result<Option<ModelDoc>, StoreError> {
        debug!(model = name, "querying Firestore for model document");
        let query = json!({
            "from": [{ "collectionId": "models" }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": "name" },
                    "op": "EQUAL",
                    "value": { "stringValue": name }
                }
            },
            "limit": 1
        });

        let Some(doc) = self.run_query(query).await? else {
            return Ok(None);
        };

        let doc_id = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Decode("model document missing resource name".into()))?
            .to_string();
        let fields = doc.get("fields").cloned().unwrap_or_default();

        Ok(Some(ModelDoc {
            doc_id,
            name: string_field(&fields, "name").unwrap_or_else(|| name.to_string()),
            active_version_id: string_field(&fields, "activeVersionId"),
        }))
    }

    async fn get_version(
        &self,
        model_doc_id: &str,
        version_id: &str,
    ) -> Result<Option<VersionDoc>, StoreError> {
        // `model_doc_id` is the full resource path returned by runQuery.
        let url = format!("{}/{}/versions/{}", self.base_url, model_doc_id, version_id);
        let request = self.client.get(&url);
        let response = self
            .authorize(request)
            .await
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Transport(format!(
                "version fetch returned HTTP {}",
                response.status()
            )));
        }

        let doc: Value =
            response.json().await.map_err(|e| StoreError::Decode(e.to_string()))?;
        let fields = doc.get("fields").cloned().unwrap_or_default();
        Ok(Some(VersionDoc { version_label: string_field(&fields, "versionLabel") }))
    }

    async fn find_active_key(&self, key_hash: &str) -> Result<Option<KeyRecord>, StoreError> {
        let query = json!({
            "from": [{ "collectionId": "api-keys" }],
            "where": {
                "compositeFilter": {
                    "op": "AND",
                    "filters": [
                        {
                            "fieldFilter": {
                                "field": { "fieldPath": "keyHash" },
                                "op": "EQUAL",
                                "value": { "stringValue": key_hash }
                            }
                        },
                        {
                            "fieldFilter": {
                                "field": { "fieldPath": "isActive" },
                                "op": "EQUAL",
                                "value": { "booleanValue": true }
                            }
                        }
                    ]
                }
            },
            "limit": 1
        });

        let Some(doc) = self.run_query(query).await? else {
            return Ok(None);
        };

        let doc_id = doc
            .get("name")
            .and_then(Value::as_str)
            .map(|path| path.rsplit('/').next().unwrap_or(path).to_string())
            .ok_or_else(|| StoreError::Decode("key document missing resource name".into()))?;
        let fields = doc.get("fields").cloned().unwrap_or_default();

        let key_type = match string_field(&fields, "type").as_deref() {
            Some("base") => KeyType::Base,
            _ => KeyType::User,
        };

        Ok(Some(KeyRecord {
            key_id: doc_id,
            key_hash: string_field(&fields, "keyHash").unwrap_or_else(|| key_hash.to_string()),
            is_active: bool_field(&fields, "isActive").unwrap_or(false),
            expires_at: timestamp_field(&fields, "expiresAt"),
            model_name: string_field(&fields, "modelName").unwrap_or_else(|| "*".to_string()),
            user_id: string_field(&fields, "userId"),
            key_type,
        }))
    }
}

fn string_field(fields: &Value, name: &str) -> Option<String> {
    fields
        .get(name)?
        .get("stringValue")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn bool_field(fields: &Value, name: &str) -> Option<bool> {
    fields.get(name)?.get("booleanValue").and_then(Value::as_bool)
}

fn timestamp_field(fields: &Value, name: &str) -> Option<DateTime<Utc>> {
    let raw = fields.get(name)?.get("timestampValue").and_then(Value::as_str)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!(field = name, error = %e, "unparseable Firestore timestamp");
            None
        }
    }
}
