//! Chat and text completion endpoints, in both URL shapes.

use crate::auth::authenticate;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use loragate_engine::{ChatOutcome, CompletionOutcome, FrameReceiver};
use loragate_values::{ChatCompletionRequest, CompletionRequest};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

/// `POST /v1/chat/completions`: model taken from the body.
pub async fn chat_completions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> ApiResult<Response> {
    let ctx =
        authenticate(&state, &headers, "/v1/chat/completions", Some(&request.model)).await?;
    run_chat(state, request, ctx).await
}

/// `POST /v1/{model_name}/chat/completions`: model in the path overrides
/// whatever the body says.
pub async fn model_chat_completions(
    State(state): State<SharedState>,
    Path(model_name): Path<String>,
    headers: HeaderMap,
    Json(mut request): Json<ChatCompletionRequest>,
) -> ApiResult<Response> {
    let path = format!("/v1/{model_name}/chat/completions");
    let ctx = authenticate(&state, &headers, &path, Some(&request.model)).await?;
    request.model = model_name;
    run_chat(state, request, ctx).await
}

/// `POST /v1/completions`: model taken from the body.
pub async fn completions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> ApiResult<Response> {
    let ctx = authenticate(&state, &headers, "/v1/completions", Some(&request.model)).await?;
    run_completion(state, request, ctx).await
}

/// `POST /v1/{model_name}/completions`: model in the path overrides the
/// body.
pub async fn model_completions(
    State(state): State<SharedState>,
    Path(model_name): Path<String>,
    headers: HeaderMap,
    Json(mut request): Json<CompletionRequest>,
) -> ApiResult<Response> {
    let path = format!("/v1/{model_name}/completions");
    let ctx = authenticate(&state, &headers, &path, Some(&request.model)).await?;
    request.model = model_name;
    run_completion(state, request, ctx).await
}

async fn run_chat(
    state: SharedState,
    request: ChatCompletionRequest,
    ctx: loragate_values::AuthContext,
) -> ApiResult<Response> {
    let request_id = uuid::Uuid::new_v4();
    info!(
        request_id = %request_id,
        model = %request.model,
        message_count = request.messages.len(),
        stream = request.stream,
        "chat completion request received"
    );
    let model = request.model.clone();
    match state.engine.chat(request, &ctx).await.map_err(|e| {
        tracing::error!(request_id = %request_id, model = %model, error = %e, "chat completion failed");
        ApiError(e)
    })? {
        ChatOutcome::Full(response) => Ok(Json(response).into_response()),
        ChatOutcome::Stream(frames) => Ok(sse_response(frames)),
    }
}

async fn run_completion(
    state: SharedState,
    request: CompletionRequest,
    ctx: loragate_values::AuthContext,
) -> ApiResult<Response> {
    let request_id = uuid::Uuid::new_v4();
    info!(
        request_id = %request_id,
        model = %request.model,
        stream = request.stream,
        "text completion request received"
    );
    let model = request.model.clone();
    match state.engine.complete(request, &ctx).await.map_err(|e| {
        tracing::error!(request_id = %request_id, model = %model, error = %e, "text completion failed");
        ApiError(e)
    })? {
        CompletionOutcome::Full(response) => Ok(Json(response).into_response()),
        CompletionOutcome::Stream(frames) => Ok(sse_response(frames)),
    }
}

/// Wrap an engine frame stream in a `text/event-stream` response body.
fn sse_response(frames: FrameReceiver) -> Response {
    let stream = ReceiverStream::new(frames).map(Ok::<_, Infallible>);
    match Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
