//! The inference engine: chat and text completion over resident models.

use crate::params::GenerationParams;
use crate::prompt::build_chat_prompt;
use crate::splice::{SplicedChunk, StreamSplicer};
use crate::worker::{join_worker, spawn_generation, WorkerBridge, WorkerEvent};
use common::ModelName;
use loragate_model_cache::{ModelCache, TokenizerProfile};
use loragate_values::{
    AuthContext, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    CompletionChunk, CompletionRequest, CompletionResponse, GatewayError, GatewayResult,
    PromptInput, StopInput, Usage,
};
use serde::Serialize;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

/// SSE frame stream handed to the HTTP layer; each item is a complete
/// `data: …\n\n` frame.
pub type FrameReceiver = mpsc::Receiver<String>;

/// Result of a chat request.
pub enum ChatOutcome {
    /// Non-streaming response.
    Full(ChatCompletionResponse),
    /// SSE frame stream.
    Stream(FrameReceiver),
}

/// Result of a text completion request.
pub enum CompletionOutcome {
    /// Non-streaming response.
    Full(CompletionResponse),
    /// SSE frame stream.
    Stream(FrameReceiver),
}

#[derive(Clone, Copy)]
enum Framing {
    Chat,
    Text,
}

impl Framing {
    fn content_frame(self, id: &str, model: &str, text: &str, first: bool) -> Option<String> {
        match self {
            Self::Chat => sse_frame(&ChatCompletionChunk::content(id, model, text, first)),
            Self::Text => sse_frame(&CompletionChunk::content(id, model, text)),
        }
    }

    fn finish_frame(self, id: &str, model: &str) -> Option<String> {
        match self {
            Self::Chat => sse_frame(&ChatCompletionChunk::finish(id, model)),
            Self::Text => sse_frame(&CompletionChunk::finish(id, model)),
        }
    }
}

fn sse_frame<T: Serialize>(chunk: &T) -> Option<String> {
    match serde_json::to_string(chunk) {
        Ok(json) => Some(format!("data: {json}\n\n")),
        Err(e) => {
            error!(error = %e, "failed to serialize stream chunk");
            None
        }
    }
}

/// Dispatches chat and text completions against the model cache, bounded by
/// a process-global concurrency semaphore held for the full lifetime of
/// each response, streaming included.
pub struct InferenceEngine {
    cache: Arc<ModelCache>,
    semaphore: Arc<Semaphore>,
}

impl InferenceEngine {
    /// Engine over `cache` with `max_concurrent` generation permits.
    pub fn new(cache: Arc<ModelCache>, max_concurrent: usize) -> Self {
        info!(max_concurrent, "initialized inference engine");
        Self { cache, semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    /// The model cache this engine serves from.
    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    /// Currently available generation permits.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Chat completion (OpenAI `/v1/chat/completions` semantics).
    pub async fn chat(
        &self,
        request: ChatCompletionRequest,
        ctx: &AuthContext,
    ) -> GatewayResult<ChatOutcome> {
        let permit = self.acquire_permit().await?;
        if ctx.authenticated {
            info!(
                model = %request.model,
                user_id = ?ctx.user_id,
                key_id = ?ctx.key_id,
                "authenticated generation request"
            );
        }

        let model_name = ModelName::new(&request.model);
        let resident = self.cache.get_model(&model_name).await?;
        let prompt = build_chat_prompt(&resident.base.profile, &request.messages);
        let request_id = loragate_values::request_id("chatcmpl");

        let params =
            GenerationParams::from_request(request.temperature, request.top_p, request.max_tokens);
        let stops = effective_stops(request.stop.clone(), &resident.base.profile);
        let stop_sequences = encode_stop_sequences(&resident.base.tokenizer, &stops);
        let prompt_ids = encode_prompt(&resident.base.tokenizer, &prompt)?;
        let prompt_tokens = prompt_ids.len();

        let bridge = spawn_generation(resident, prompt_ids, params, stop_sequences);

        if request.stream {
            let frames = self.stream_frames(
                bridge,
                permit,
                Framing::Chat,
                request_id,
                request.model.clone(),
                stops,
            );
            return Ok(ChatOutcome::Stream(frames));
        }

        let (text, completion_tokens) =
            self.collect_full(bridge, &request.model, &stops).await?;
        drop(permit);
        Ok(ChatOutcome::Full(ChatCompletionResponse::stop(
            request_id,
            request.model,
            text,
            Usage::new(prompt_tokens, completion_tokens),
        )))
    }

    /// Text completion (OpenAI `/v1/completions` semantics).
    pub async fn complete(
        &self,
        request: CompletionRequest,
        ctx: &AuthContext,
    ) -> GatewayResult<CompletionOutcome> {
        let permit = self.acquire_permit().await?;
        if ctx.authenticated {
            info!(
                model = %request.model,
                user_id = ?ctx.user_id,
                key_id = ?ctx.key_id,
                "authenticated completion request"
            );
        }

        let prompt = match &request.prompt {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Batch(batch) => {
                if batch.len() > 1 {
                    return Err(GatewayError::BadRequest(
                        "Only single prompt supported (n=1)".to_string(),
                    ));
                }
                batch.first().cloned().ok_or_else(|| {
                    GatewayError::BadRequest("prompt cannot be empty".to_string())
                })?
            }
        };

        let model_name = ModelName::new(&request.model);
        let resident = self.cache.get_model(&model_name).await?;
        let request_id = loragate_values::request_id("cmpl");

        let params =
            GenerationParams::from_request(request.temperature, request.top_p, request.max_tokens);
        let stops = effective_stops(request.stop.clone(), &resident.base.profile);
        let stop_sequences = encode_stop_sequences(&resident.base.tokenizer, &stops);
        let prompt_ids = encode_prompt(&resident.base.tokenizer, &prompt)?;
        let prompt_tokens = prompt_ids.len();

        let bridge = spawn_generation(resident, prompt_ids, params, stop_sequences);

        if request.stream {
            let frames = self.stream_frames(
                bridge,
                permit,
                Framing::Text,
                request_id,
                request.model.clone(),
                stops,
            );
            return Ok(CompletionOutcome::Stream(frames));
        }

        let (text, completion_tokens) =
            self.collect_full(bridge, &request.model, &stops).await?;
        drop(permit);
        Ok(CompletionOutcome::Full(CompletionResponse::stop(
            request_id,
            request.model,
            text,
            Usage::new(prompt_tokens, completion_tokens),
        )))
    }

    async fn acquire_permit(&self) -> GatewayResult<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Internal("concurrency limiter closed".to_string()))
    }

    /// Drain a worker to completion, join it, and strip stop strings.
    async fn collect_full(
        &self,
        bridge: WorkerBridge,
        model: &str,
        stops: &[String],
    ) -> GatewayResult<(String, usize)> {
        let WorkerBridge { mut rx, error, handle } = bridge;
        let mut text = String::new();
        let mut completion_tokens = 0usize;
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Text(chunk) => text.push_str(&chunk),
                WorkerEvent::Done { completion_tokens: n } => completion_tokens = n,
            }
        }
        drop(rx);

        let join_result = join_worker(handle, model).await;
        if let Some(worker_error) = error.lock().take() {
            self.recover(&worker_error);
            return Err(worker_error);
        }
        if let Err(join_error) = join_result {
            self.recover(&join_error);
            return Err(join_error);
        }

        Ok((strip_stop_strings(&text, stops), completion_tokens))
    }

    /// Spawn the SSE driver task. It owns the semaphore permit for the
    /// stream's lifetime; a dropped client closes the frame channel, the
    /// driver drops the worker receiver, and the worker cancels on its next
    /// send.
    fn stream_frames(
        &self,
        bridge: WorkerBridge,
        permit: OwnedSemaphorePermit,
        framing: Framing,
        request_id: String,
        model: String,
        stops: Vec<String>,
    ) -> FrameReceiver {
        let (frames_tx, frames_rx) = mpsc::channel::<String>(64);
        let cache = self.cache.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let WorkerBridge { mut rx, error, handle } = bridge;
            let mut splicer = StreamSplicer::new(stops);
            let mut first = true;
            let mut client_gone = false;

            while let Some(event) = rx.recv().await {
                let chunk = match event {
                    WorkerEvent::Text(text) => text,
                    WorkerEvent::Done { .. } => break,
                };
                match splicer.push(&chunk) {
                    SplicedChunk::Hold => {}
                    SplicedChunk::Text(out) => {
                        if !send_content(&frames_tx, framing, &request_id, &model, &out, &mut first)
                            .await
                        {
                            client_gone = true;
                            break;
                        }
                    }
                    SplicedChunk::Stopped(out) => {
                        if !out.is_empty() {
                            send_content(&frames_tx, framing, &request_id, &model, &out, &mut first)
                                .await;
                        }
                        break;
                    }
                }
            }

            if !splicer.finished_by_stop() && !client_gone {
                if let Some(rest) = splicer.finish() {
                    send_content(&frames_tx, framing, &request_id, &model, &rest, &mut first)
                        .await;
                }
            }

            // Unblock the worker before joining it.
            drop(rx);
            let join_result = join_worker(handle, &model).await;
            if let Some(worker_error) = error.lock().take() {
                error!(model = %model, error = %worker_error, "streaming generation failed");
                recover_with(&cache, &worker_error);
                return;
            }
            if let Err(join_error) = join_result {
                error!(model = %model, error = %join_error, "generation worker did not stop");
                recover_with(&cache, &join_error);
                return;
            }
            if client_gone {
                return;
            }

            if let Some(frame) = framing.finish_frame(&request_id, &model) {
                let _ = frames_tx.send(frame).await;
            }
            let _ = frames_tx.send("data: [DONE]\n\n".to_string()).await;
        });

        frames_rx
    }

    fn recover(&self, err: &GatewayError) {
        recover_with(&self.cache, err);
    }
}

/// Post-failure recovery: GPU faults clear the device cache; every fatal
/// model error unloads the implicated model so the process keeps serving
/// other models.
fn recover_with(cache: &Arc<ModelCache>, err: &GatewayError) {
    let Some(model) = err.implicates_model() else {
        return;
    };
    if matches!(err, GatewayError::GpuFault { .. }) {
        warn!(model, "GPU fault detected, releasing device cache");
        cache.device_profile().release_device_cache();
    }
    let removed = cache.unload(&ModelName::new(model));
    info!(model, removed, "unloaded model after generation failure");
}

/// Send one content frame; returns whether the client is still connected.
async fn send_content(
    frames_tx: &mpsc::Sender<String>,
    framing: Framing,
    request_id: &str,
    model: &str,
    text: &str,
    first: &mut bool,
) -> bool {
    let Some(frame) = framing.content_frame(request_id, model, text, *first) else {
        return true;
    };
    *first = false;
    frames_tx.send(frame).await.is_ok()
}

/// Effective stops: request-provided if any, else the tokenizer profile's
/// configured defaults.
pub fn effective_stops(request_stop: Option<StopInput>, profile: &TokenizerProfile) -> Vec<String> {
    match request_stop {
        Some(stop) => {
            let stops = stop.into_vec();
            if stops.is_empty() {
                profile.stop_tokens.clone()
            } else {
                stops
            }
        }
        None => profile.stop_tokens.clone(),
    }
}

/// Encode stop strings to token sequences; unencodable stops are dropped.
pub fn encode_stop_sequences(tokenizer: &Tokenizer, stops: &[String]) -> Vec<Vec<u32>> {
    stops
        .iter()
        .filter_map(|stop| tokenizer.encode(stop.as_str(), false).ok())
        .map(|encoding| encoding.get_ids().to_vec())
        .filter(|ids| !ids.is_empty())
        .collect()
}

fn encode_prompt(tokenizer: &Tokenizer, prompt: &str) -> GatewayResult<Vec<u32>> {
    tokenizer
        .encode(prompt, true)
        .map(|encoding| encoding.get_ids().to_vec())
        .map_err(|e| GatewayError::Internal(format!("prompt encoding failed: {e}")))
}

/// Truncate at the earliest stop-string occurrence, dropping the stop and
/// everything after it.
pub fn strip_stop_strings(text: &str, stops: &[String]) -> String {
    match stops.iter().filter_map(|stop| text.find(stop.as_str())).min() {
        Some(pos) => text[..pos].to_string(),
        None => text.to_string(),
    }
}
