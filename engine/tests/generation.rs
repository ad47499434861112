//! End-to-end generation tests over a tiny zero-weight model.
//!
//! A zero-initialized decoder produces uniform logits, so greedy decoding
//! deterministically picks token 0. That is enough to exercise the whole
//! worker pipeline: forward pass, sampling, incremental detokenization,
//! channel bridging and the join deadline.

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use loragate_engine::{
    join_worker, spawn_generation, GenerationParams, WorkerEvent,
};
use loragate_model_cache::{
    LlamaModel, ModelArchConfig, ResidentBase, ResidentModel, TokenizerProfile,
    DEFAULT_CHAT_TEMPLATE,
};
use std::sync::Arc;
use tokenizers::Tokenizer;

fn tiny_config() -> ModelArchConfig {
    serde_json::from_str(
        r#"{
            "vocab_size": 32,
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "rms_norm_eps": 1e-05,
            "rope_theta": 10000.0,
            "max_position_embeddings": 64,
            "tie_word_embeddings": true,
            "model_type": "llama"
        }"#,
    )
    .unwrap()
}

/// Character-level tokenizer whose token ids are alphabet indices, with a
/// fuse decoder so decoded text concatenates cleanly. Token 0 is `a`.
fn char_tokenizer() -> Tokenizer {
    let alphabet: Vec<char> = "abcdefghijklmnopqrstuvwxyz :.\n!?".chars().collect();
    let vocab: serde_json::Map<String, serde_json::Value> = alphabet
        .iter()
        .enumerate()
        .map(|(i, c)| (c.to_string(), serde_json::Value::from(i as u64)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": null,
        "post_processor": null,
        "decoder": { "type": "Fuse" },
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": serde_json::Value::Object(vocab),
            "merges": []
        }
    });
    serde_json::from_str(&json.to_string()).unwrap()
}

fn tiny_resident(eos_token_id: Option<u32>) -> ResidentModel {
    let cfg = tiny_config();
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let model = LlamaModel::load(vb, &cfg).unwrap();
    let base = Arc::new(ResidentBase {
        model: Arc::new(model),
        tokenizer: Arc::new(char_tokenizer()),
        profile: Arc::new(TokenizerProfile {
            eos_token_id,
            pad_token_id: eos_token_id,
            chat_template: DEFAULT_CHAT_TEMPLATE.to_string(),
            native_chat_template: false,
            stop_tokens: vec![],
            bos_token: None,
            eos_token: None,
        }),
        memory_gb: 0.01,
    });
    ResidentModel {
        name: "tiny-test-model".to_string(),
        base,
        adapter: None,
        memory_gb: 0.01,
    }
}

async fn drain(
    mut rx: tokio::sync::mpsc::Receiver<WorkerEvent>,
) -> (String, Option<usize>) {
    let mut text = String::new();
    let mut done = None;
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::Text(t) => text.push_str(&t),
            WorkerEvent::Done { completion_tokens } => done = Some(completion_tokens),
        }
    }
    (text, done)
}

#[tokio::test(flavor = "multi_thread")]
async fn greedy_generation_is_deterministic() {
    let resident = tiny_resident(None);
    let prompt_ids = vec![1u32, 2, 3];
    let params = GenerationParams::from_request(0.0, 1.0, 4);

    let bridge = spawn_generation(resident, prompt_ids, params, vec![]);
    let (text, done) = drain(bridge.rx).await;

    // Zero weights give uniform logits; argmax picks token 0 ("a") forever.
    assert_eq!(text, "aaaa");
    assert_eq!(done, Some(4));
    assert!(bridge.error.lock().is_none());
    join_worker(bridge.handle, "tiny-test-model").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn eos_token_ends_generation_early() {
    // eos is token 0, the argmax choice, so generation stops after the
    // first token.
    let resident = tiny_resident(Some(0));
    let params = GenerationParams::from_request(0.0, 1.0, 16);

    let bridge = spawn_generation(resident, vec![1u32, 2], params, vec![]);
    let (text, done) = drain(bridge.rx).await;

    assert_eq!(done, Some(1));
    assert!(text.len() <= 1, "eos must cut generation short, got {text:?}");
    join_worker(bridge.handle, "tiny-test-model").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn token_level_stop_sequence_halts_generation() {
    let resident = tiny_resident(None);
    let params = GenerationParams::from_request(0.0, 1.0, 16);

    // Token 0 is generated immediately, so a single-token stop on it fires
    // on the first step.
    let bridge = spawn_generation(resident, vec![1u32, 2], params, vec![vec![0]]);
    let (_text, done) = drain(bridge.rx).await;

    assert_eq!(done, Some(1));
    join_worker(bridge.handle, "tiny-test-model").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_receiver_cancels_the_worker() {
    let resident = tiny_resident(None);
    let params = GenerationParams::from_request(0.0, 1.0, 4096);

    let bridge = spawn_generation(resident, vec![1u32], params, vec![]);
    drop(bridge.rx);

    // The worker notices the closed channel on its next send and exits well
    // within the join deadline.
    join_worker(bridge.handle, "tiny-test-model").await.unwrap();
    assert!(bridge.error.lock().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn sampling_path_stays_in_vocabulary() {
    let resident = tiny_resident(None);
    let params = GenerationParams::from_request(2.0, 0.95, 8);

    let bridge = spawn_generation(resident, vec![1u32, 2, 3], params, vec![]);
    let (_text, done) = drain(bridge.rx).await;

    assert_eq!(done, Some(8));
    join_worker(bridge.handle, "tiny-test-model").await.unwrap();
}
