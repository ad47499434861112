//! Admin surface: cache management, diagnostics and prewarming.
//!
//! Every admin route requires authentication (any valid key); in local dev
//! with auth disabled they are reachable without credentials.

use crate::auth::authenticate;
use crate::error::ApiResult;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use common::ModelName;
use loragate_hardware as hardware;
use loragate_registry::VersionCacheStats;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

/// `POST /admin/unload/{model_id}`: idempotent manual unload.
pub async fn unload_model(
    State(state): State<SharedState>,
    Path(model_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = authenticate(&state, &headers, "/admin/unload", None).await?;
    let model_unloaded = state.cache.unload(&ModelName::new(&model_id));
    info!(model = %model_id, model_unloaded, "admin unload");
    Ok(Json(json!({
        "message": format!("Model {model_id} unloaded"),
        "model_unloaded": model_unloaded,
        "requested_by": ctx.user_id,
    })))
}

/// `GET /admin/stats`: resident set, memory and concurrency stats.
pub async fn stats(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers, "/admin/stats", None).await?;

    let resident = state.cache.stats();
    let (available_gb, _) = hardware::available_memory(state.profile.kind);
    Ok(Json(json!({
        "loaded_models": state.cache.list(),
        "model_count": resident.len(),
        "resident": resident,
        "resident_memory_gb": state.cache.total_resident_gb(),
        "device": {
            "kind": state.profile.kind.to_string(),
            "precision": state.profile.precision.to_string(),
            "available_memory_gb": available_gb,
        },
        "max_concurrent_requests": state.config.max_concurrent(),
        "available_permits": state.engine.available_permits(),
        "request_timeout_secs": state.config.request_timeout().as_secs(),
        "memory_soft_limit": state.config.memory_soft_limit,
        "min_free_memory_gb": state.config.min_free_memory_gb,
        "gcs_bucket": state.config.gcs_bucket,
    })))
}

/// `POST /admin/invalidate-cache/{model_name}`: drop the version cache
/// entry and unload the model if resident.
pub async fn invalidate_cache(
    State(state): State<SharedState>,
    Path(model_name): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers, "/admin/invalidate-cache", None).await?;

    let name = ModelName::new(&model_name);
    let was_cached = state.resolver.invalidate(&name);
    let model_unloaded = state.cache.unload(&name);
    info!(model = %model_name, was_cached, model_unloaded, "admin cache invalidation");
    Ok(Json(json!({
        "model": model_name,
        "was_cached": was_cached,
        "model_unloaded": model_unloaded,
    })))
}

/// `POST /admin/clear-all-version-cache`: drop every version cache entry.
pub async fn clear_all_version_cache(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers, "/admin/clear-all-version-cache", None).await?;
    let cleared_entries = state.resolver.clear_all();
    Ok(Json(json!({ "cleared_entries": cleared_entries })))
}

/// `GET /admin/version-cache-stats`: version cache diagnostics.
pub async fn version_cache_stats(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<VersionCacheStats>> {
    authenticate(&state, &headers, "/admin/version-cache-stats", None).await?;
    Ok(Json(state.resolver.stats()))
}

/// Prewarm request body.
#[derive(Debug, Deserialize)]
pub struct PrewarmRequest {
    /// Models to load.
    pub model_ids: Vec<String>,
    /// Load concurrently instead of one by one.
    #[serde(default)]
    pub parallel: bool,
}

/// Per-model prewarm outcome.
#[derive(Debug, Serialize)]
pub struct PrewarmResult {
    /// The model that was loaded.
    pub model_id: String,
    /// `loaded` or `error`.
    pub status: &'static str,
    /// Memory attributed to the entry when loading succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<f64>,
    /// Failure detail when loading failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /admin/prewarm`: load a list of models ahead of traffic.
pub async fn prewarm(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<PrewarmRequest>,
) -> ApiResult<Json<Value>> {
    authenticate(&state, &headers, "/admin/prewarm", None).await?;
    info!(
        count = request.model_ids.len(),
        parallel = request.parallel,
        "prewarm requested"
    );

    let results: Vec<PrewarmResult> = if request.parallel {
        futures::future::join_all(
            request.model_ids.iter().map(|id| prewarm_one(&state, id)),
        )
        .await
    } else {
        let mut results = Vec::with_capacity(request.model_ids.len());
        for id in &request.model_ids {
            results.push(prewarm_one(&state, id).await);
        }
        results
    };

    Ok(Json(json!({ "results": results })))
}

async fn prewarm_one(state: &SharedState, model_id: &str) -> PrewarmResult {
    match state.cache.get_model(&ModelName::new(model_id)).await {
        Ok(resident) => PrewarmResult {
            model_id: model_id.to_string(),
            status: "loaded",
            memory_gb: Some(resident.memory_gb),
            error: None,
        },
        Err(e) => PrewarmResult {
            model_id: model_id.to_string(),
            status: "error",
            memory_gb: None,
            error: Some(e.to_string()),
        },
    }
}
