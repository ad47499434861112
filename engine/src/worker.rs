//! The blocking generation worker and its bridge to async handlers.
//!
//! Generation runs on a dedicated thread per request. Decoded text flows
//! through a bounded channel; failures land in a one-slot error cell read
//! by the handler after the channel drains. Dropping the receiver cancels
//! the worker: its next send fails and the loop exits after the token in
//! flight.

use crate::logits::sanitize_logits;
use crate::params::GenerationParams;
use crate::stopping::StopOnTokens;
use crate::stream::TokenStream;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;
use loragate_model_cache::ResidentModel;
use loragate_values::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// How long the handler waits for the worker thread after the stream ends.
pub const JOIN_DEADLINE: Duration = Duration::from_secs(5);

/// Events flowing from the worker to the handler.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Newly decoded text.
    Text(String),
    /// Generation finished normally.
    Done {
        /// Number of tokens generated.
        completion_tokens: usize,
    },
}

/// Handler-side ends of a running generation.
pub struct WorkerBridge {
    /// Decoded-text event stream.
    pub rx: mpsc::Receiver<WorkerEvent>,
    /// One-slot error cell filled by the worker on failure.
    pub error: Arc<Mutex<Option<GatewayError>>>,
    /// The worker thread handle.
    pub handle: std::thread::JoinHandle<()>,
}

/// Spawn the generation worker for a resident model.
pub fn spawn_generation(
    resident: ResidentModel,
    prompt_ids: Vec<u32>,
    params: GenerationParams,
    stop_sequences: Vec<Vec<u32>>,
) -> WorkerBridge {
    let (tx, rx) = mpsc::channel::<WorkerEvent>(32);
    let error: Arc<Mutex<Option<GatewayError>>> = Arc::new(Mutex::new(None));
    let error_slot = error.clone();

    let handle = std::thread::spawn(move || {
        match run_generation(&resident, prompt_ids, &params, stop_sequences, &tx) {
            Ok(completion_tokens) => {
                let _ = tx.blocking_send(WorkerEvent::Done { completion_tokens });
            }
            Err(e) => {
                error!(model = %resident.name, error = %e, "generation worker failed");
                *error_slot.lock() = Some(e);
            }
        }
    });

    WorkerBridge { rx, error, handle }
}

/// The autoregressive loop. Returns the number of generated tokens.
fn run_generation(
    resident: &ResidentModel,
    prompt_ids: Vec<u32>,
    params: &GenerationParams,
    stop_sequences: Vec<Vec<u32>>,
    tx: &mpsc::Sender<WorkerEvent>,
) -> GatewayResult<usize> {
    let model = &resident.base.model;
    let device = model.device().clone();
    let adapter = resident.adapter.as_deref();
    let eos_token_id = resident.base.profile.eos_token_id;

    let sampling = if params.do_sample {
        Sampling::TopKThenTopP {
            k: params.top_k,
            p: params.top_p,
            temperature: params.temperature,
        }
    } else {
        Sampling::ArgMax
    };
    let mut sampler = LogitsProcessor::from_sampling(params.seed, sampling);
    let stopper = StopOnTokens::new(stop_sequences);

    let mut cache = model.new_cache();
    let mut text_stream = TokenStream::new(resident.base.tokenizer.clone());
    let mut generated: Vec<u32> = Vec::new();
    let mut input: Vec<u32> = prompt_ids;
    let mut pos = 0usize;

    for _ in 0..params.max_tokens {
        let input_t = Tensor::new(&input[..], &device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| classify_device_error(&resident.name, e))?;
        let logits = model
            .forward(&input_t, pos, &mut cache, adapter)
            .map_err(|e| classify_device_error(&resident.name, e))?;
        pos += input.len();

        let logits = logits
            .get(0)
            .map_err(|e| classify_device_error(&resident.name, e))?;
        let mut raw: Vec<f32> = logits
            .to_vec1()
            .map_err(|e| classify_device_error(&resident.name, e))?;
        if sanitize_logits(&mut raw) {
            debug!(model = %resident.name, "sanitized non-finite logits");
        }
        let vocab = raw.len();
        let logits = Tensor::from_vec(raw, vocab, &Device::Cpu)
            .map_err(|e| classify_device_error(&resident.name, e))?;
        let logits = apply_repeat_penalty(&logits, params.repetition_penalty, &generated)
            .map_err(|e| classify_device_error(&resident.name, e))?;

        let next = sampler
            .sample(&logits)
            .map_err(|e| classify_device_error(&resident.name, e))?;
        generated.push(next);

        if let Some(text) = text_stream.next_token(next)? {
            if tx.blocking_send(WorkerEvent::Text(text)).is_err() {
                // Consumer cancelled; finish the token in flight and stop.
                return Ok(generated.len());
            }
        }

        if eos_token_id == Some(next) {
            break;
        }
        if stopper.should_stop(&generated) {
            break;
        }
        input = vec![next];
    }

    if let Some(rest) = text_stream.decode_rest()? {
        let _ = tx.blocking_send(WorkerEvent::Text(rest));
    }
    Ok(generated.len())
}

/// Wait for the worker thread with the join deadline. A worker still alive
/// past the deadline is a fatal `GenerationTimeout`.
pub async fn join_worker(
    handle: std::thread::JoinHandle<()>,
    model: &str,
) -> GatewayResult<()> {
    let join = tokio::task::spawn_blocking(move || handle.join());
    match tokio::time::timeout(JOIN_DEADLINE, join).await {
        Err(_) => Err(GatewayError::GenerationTimeout {
            model: model.to_string(),
            seconds: JOIN_DEADLINE.as_secs(),
        }),
        Ok(Err(e)) => Err(GatewayError::Internal(format!("worker join task failed: {e}"))),
        Ok(Ok(Err(_))) => {
            Err(GatewayError::Internal("generation worker panicked".to_string()))
        }
        Ok(Ok(Ok(()))) => Ok(()),
    }
}

/// Classify a framework error: CUDA faults and out-of-memory conditions get
/// their own recovery paths.
pub fn classify_device_error(model: &str, e: candle_core::Error) -> GatewayError {
    let message = e.to_string();
    if message.contains("CUDA") || message.contains("cuda") {
        GatewayError::GpuFault { model: model.to_string(), reason: message }
    } else if message.to_lowercase().contains("out of memory") {
        GatewayError::OutOfMemory { model: model.to_string(), reason: message }
    } else {
        GatewayError::Internal(format!("generation failed for {model}: {message}"))
    }
}
