//! Public service-info and health endpoints.

use crate::state::SharedState;
use axum::{extract::State, Json};
use loragate_values::{ModelInfo, ModelListResponse};
use serde_json::{json, Value};

/// `GET /`: service information.
pub async fn root(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "service": "loragate inference gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "device": state.profile.kind.to_string(),
        "loaded_models": state.cache.list(),
    }))
}

/// `GET /health`: health probe.
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    let loaded = state.cache.list();
    Json(json!({
        "status": "healthy",
        "device": state.profile.kind.to_string(),
        "loaded_models_count": loaded.len(),
        "loaded_models": loaded,
    }))
}

/// `GET /v1/models`: resident models in the OpenAI list envelope.
pub async fn list_models(State(state): State<SharedState>) -> Json<ModelListResponse> {
    let data = state.cache.list().into_iter().map(ModelInfo::resident).collect();
    Json(ModelListResponse::new(data))
}
