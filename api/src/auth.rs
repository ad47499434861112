//! Bearer authentication and model scoping.

use crate::state::GatewayState;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use loragate_registry::hash_key;
use loragate_values::{AuthContext, GatewayError, GatewayResult};
use tracing::{debug, info, warn};

/// Routes that skip authentication entirely.
pub const PUBLIC_PATHS: &[&str] = &["/", "/health", "/v1/models"];

/// Pull the model name out of `/v1/{name}/…` paths. The fixed segments
/// `chat`, `completions` and `models` are never model names.
pub fn extract_model_from_path(path: &str) -> Option<String> {
    let mut parts = path.trim_matches('/').split('/');
    if parts.next() != Some("v1") {
        return None;
    }
    let candidate = parts.next()?;
    if matches!(candidate, "chat" | "completions" | "models") {
        return None;
    }
    Some(candidate.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Run the auth pipeline for one request.
///
/// Public paths skip auth; with auth globally disabled a synthetic context
/// is attached. Otherwise the bearer token is validated (prefix, static
/// key, hash lookup through the TTL cache), expiry is enforced, and the
/// requested model (path first, body second) is checked against the key's
/// scope.
pub async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
    path: &str,
    body_model: Option<&str>,
) -> GatewayResult<AuthContext> {
    if PUBLIC_PATHS.contains(&path) {
        return Ok(AuthContext::public());
    }

    let path_model = extract_model_from_path(path);

    if !state.config.require_auth {
        debug!(path, "auth bypass enabled for local development");
        return Ok(AuthContext::local_dev(path_model));
    }

    let token = bearer_token(headers).ok_or(GatewayError::AuthMissing)?;
    if !(token.starts_with("sk_") || token.starts_with("ak_")) {
        warn!(path, "rejected API key with invalid prefix");
        return Err(GatewayError::AuthMalformed);
    }

    if let Some(static_key) = state.config.base_model_api_key.as_deref() {
        if !static_key.is_empty() && token == static_key {
            info!(path, "base-model static key used");
            return Ok(AuthContext::base_key(path_model));
        }
    }

    let key_hash = hash_key(token);
    let record = match state.key_cache.get(&key_hash) {
        Some(record) => record,
        None => {
            debug!(key_prefix = &key_hash[..8], "key cache miss, querying store");
            let record = state
                .store
                .find_active_key(&key_hash)
                .await
                .map_err(|e| {
                    warn!(error = %e, "API key lookup failed");
                    GatewayError::MetadataStoreUnavailable(e.to_string())
                })?
                .ok_or(GatewayError::AuthInvalid)?;
            state.key_cache.insert(key_hash.clone(), record.clone());
            record
        }
    };

    if record.is_expired(Utc::now()) {
        warn!(key_id = %record.key_id, "expired API key attempted");
        return Err(GatewayError::AuthExpired);
    }

    let requested_model = path_model.clone().or_else(|| body_model.map(str::to_string));
    if let Some(model) = &requested_model {
        if !record.allows_model(model) {
            warn!(
                key_id = %record.key_id,
                allowed = %record.model_name,
                requested = %model,
                "access denied by key scope"
            );
            return Err(GatewayError::ScopeDenied { model: model.clone() });
        }
    }

    info!(
        key_id = %record.key_id,
        user_id = ?record.user_id,
        model = ?requested_model,
        "authenticated request"
    );
    Ok(AuthContext::from_key(&record, path_model))
}
