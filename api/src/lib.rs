//! HTTP API layer for the loragate gateway.
//!
//! Axum router over the shared gateway state: the OpenAI-compatible
//! completion surface in both URL shapes, public health routes, and the
//! authenticated admin surface.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod auth;
mod error;
mod routes;
mod state;

pub use auth::{authenticate, extract_model_from_path, PUBLIC_PATHS};
pub use error::{ApiError, ApiResult};
pub use state::{GatewayState, SharedState};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Assemble the router over shared state. Exposed separately so
/// integration tests can drive it with `tower::ServiceExt::oneshot`.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/", get(routes::health::root))
        .route("/health", get(routes::health::health))
        .route("/v1/models", get(routes::health::list_models))
        .route("/v1/chat/completions", post(routes::completions::chat_completions))
        .route("/v1/completions", post(routes::completions::completions))
        .route(
            "/v1/{model_name}/chat/completions",
            post(routes::completions::model_chat_completions),
        )
        .route(
            "/v1/{model_name}/completions",
            post(routes::completions::model_completions),
        )
        .route("/admin/unload/{model_id}", post(routes::admin::unload_model))
        .route("/admin/stats", get(routes::admin::stats))
        .route(
            "/admin/invalidate-cache/{model_name}",
            post(routes::admin::invalidate_cache),
        )
        .route(
            "/admin/clear-all-version-cache",
            post(routes::admin::clear_all_version_cache),
        )
        .route("/admin/version-cache-stats", get(routes::admin::version_cache_stats))
        .route("/admin/prewarm", post(routes::admin::prewarm))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn run_server(
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("loragate gateway listening on http://{addr}");

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
