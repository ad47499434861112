//! Llama-family decoder with optional LoRA deltas.
//!
//! Covers the architectures the fine-tuning pipeline produces (Llama,
//! Mistral, Qwen2-style configs): RMSNorm, rotary embeddings, grouped-query
//! attention and a SwiGLU MLP. Every projection accepts an optional LoRA
//! delta at call time, so an adapted model is the base weights plus a small
//! owned adapter rather than a second copy of the weights.

use crate::lora::LoraAdapter;
use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{
    embedding, linear, linear_no_bias, rms_norm, Embedding, Linear, Module, RmsNorm, VarBuilder,
};
use candle_transformers::utils::repeat_kv;
use serde::Deserialize;

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

/// Architecture configuration parsed from a HuggingFace `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelArchConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden dimension
    pub hidden_size: usize,
    /// MLP intermediate dimension
    pub intermediate_size: usize,
    /// Number of transformer blocks
    pub num_hidden_layers: usize,
    /// Number of attention heads
    pub num_attention_heads: usize,
    /// Number of key/value heads (grouped-query attention)
    pub num_key_value_heads: Option<usize>,
    /// RMSNorm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Rotary embedding base frequency
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Whether the output head shares the embedding matrix
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Whether attention projections carry a bias
    #[serde(default)]
    pub attention_bias: bool,
    /// HuggingFace architecture tag (`llama`, `mistral`, `qwen2`, …)
    #[serde(default)]
    pub model_type: Option<String>,
}

impl ModelArchConfig {
    /// Effective key/value head count.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Qwen2-style checkpoints carry q/k/v biases even when the config
    /// omits the flag.
    pub fn uses_qkv_bias(&self) -> bool {
        self.attention_bias || self.model_type.as_deref() == Some("qwen2")
    }
}

/// Rotary position embedding tables.
#[derive(Debug)]
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(cfg: &ModelArchConfig, dtype: DType, device: &Device) -> Result<Self> {
        let dim = cfg.head_dim();
        let max_pos = cfg.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1f32 / (cfg.rope_theta as f32).powf(i as f32 / dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let positions = Tensor::arange(0u32, max_pos as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_pos, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self { cos: freqs.cos()?.to_dtype(dtype)?, sin: freqs.sin()?.to_dtype(dtype)? })
    }

    /// Apply to a `(batch, heads, seq, head_dim)` tensor at `pos`.
    fn apply(&self, xs: &Tensor, pos: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, _d) = xs.dims4()?;
        let cos = self.cos.narrow(0, pos, seq_len)?;
        let sin = self.sin.narrow(0, pos, seq_len)?;
        candle_nn::rotary_emb::rope(&xs.contiguous()?, &cos, &sin)
    }
}

/// Per-layer key/value cache.
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    fn new(num_layers: usize) -> Self {
        Self { layers: (0..num_layers).map(|_| None).collect() }
    }

    fn append(&mut self, layer: usize, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match self.layers[layer].take() {
            Some((prev_k, prev_v)) => {
                let k = Tensor::cat(&[&prev_k, &k], 2)?.contiguous()?;
                let v = Tensor::cat(&[&prev_v, &v], 2)?.contiguous()?;
                (k, v)
            }
            None => (k.contiguous()?, v.contiguous()?),
        };
        self.layers[layer] = Some((k.clone(), v.clone()));
        Ok((k, v))
    }
}

/// A linear projection that consults the adapter for a LoRA delta.
#[derive(Debug)]
struct AdaptedLinear {
    inner: Linear,
    layer: usize,
    module: &'static str,
}

impl AdaptedLinear {
    fn forward(&self, xs: &Tensor, adapter: Option<&LoraAdapter>) -> Result<Tensor> {
        let base = self.inner.forward(xs)?;
        match adapter.and_then(|a| a.delta(self.layer, self.module)) {
            Some(delta) => delta.apply(xs, &base),
            None => Ok(base),
        }
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: AdaptedLinear,
    k_proj: AdaptedLinear,
    v_proj: AdaptedLinear,
    o_proj: AdaptedLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, cfg: &ModelArchConfig, layer: usize) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = cfg.head_dim();
        let kv_dim = cfg.num_kv_heads() * head_dim;
        let qkv_linear = |in_dim, out_dim, vb| {
            if cfg.uses_qkv_bias() {
                linear(in_dim, out_dim, vb)
            } else {
                linear_no_bias(in_dim, out_dim, vb)
            }
        };
        Ok(Self {
            q_proj: AdaptedLinear {
                inner: qkv_linear(hidden, hidden, vb.pp("q_proj"))?,
                layer,
                module: "q_proj",
            },
            k_proj: AdaptedLinear {
                inner: qkv_linear(hidden, kv_dim, vb.pp("k_proj"))?,
                layer,
                module: "k_proj",
            },
            v_proj: AdaptedLinear {
                inner: qkv_linear(hidden, kv_dim, vb.pp("v_proj"))?,
                layer,
                module: "v_proj",
            },
            o_proj: AdaptedLinear {
                inner: linear_no_bias(hidden, hidden, vb.pp("o_proj"))?,
                layer,
                module: "o_proj",
            },
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_kv_heads(),
            head_dim,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        xs: &Tensor,
        rope: &RotaryEmbedding,
        pos: usize,
        mask: Option<&Tensor>,
        cache: &mut KvCache,
        layer: usize,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = xs.dims3()?;

        let q = self.q_proj.forward(xs, adapter)?;
        let k = self.k_proj.forward(xs, adapter)?;
        let v = self.v_proj.forward(xs, adapter)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rope.apply(&q, pos)?;
        let k = rope.apply(&k, pos)?;

        let (k, v) = cache.append(layer, k, v)?;
        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let att = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let att = match mask {
            Some(mask) => att.broadcast_add(mask)?,
            None => att,
        };
        // Softmax in f32 keeps bf16 attention numerically stable.
        let att = candle_nn::ops::softmax_last_dim(&att.to_dtype(DType::F32)?)?
            .to_dtype(v.dtype())?;
        let out = att.matmul(&v.contiguous()?)?;
        let out = out
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out, adapter)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: AdaptedLinear,
    up_proj: AdaptedLinear,
    down_proj: AdaptedLinear,
}

impl Mlp {
    fn load(vb: VarBuilder, cfg: &ModelArchConfig, layer: usize) -> Result<Self> {
        Ok(Self {
            gate_proj: AdaptedLinear {
                inner: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("gate_proj"))?,
                layer,
                module: "gate_proj",
            },
            up_proj: AdaptedLinear {
                inner: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("up_proj"))?,
                layer,
                module: "up_proj",
            },
            down_proj: AdaptedLinear {
                inner: linear_no_bias(cfg.intermediate_size, cfg.hidden_size, vb.pp("down_proj"))?,
                layer,
                module: "down_proj",
            },
        })
    }

    fn forward(&self, xs: &Tensor, adapter: Option<&LoraAdapter>) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs, adapter)?.silu()?;
        let up = self.up_proj.forward(xs, adapter)?;
        self.down_proj.forward(&(gate * up)?, adapter)
    }
}

#[derive(Debug)]
struct Block {
    input_layernorm: RmsNorm,
    attention: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, cfg: &ModelArchConfig, layer: usize) -> Result<Self> {
        Ok(Self {
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            attention: Attention::load(vb.pp("self_attn"), cfg, layer)?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(vb.pp("mlp"), cfg, layer)?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        xs: &Tensor,
        rope: &RotaryEmbedding,
        pos: usize,
        mask: Option<&Tensor>,
        cache: &mut KvCache,
        layer: usize,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self
            .attention
            .forward(&xs, rope, pos, mask, cache, layer, adapter)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let out = self.mlp.forward(&self.post_attention_layernorm.forward(&xs)?, adapter)?;
        out + residual
    }
}

/// A loaded llama-family causal language model.
#[derive(Debug)]
pub struct LlamaModel {
    embed_tokens: Embedding,
    blocks: Vec<Block>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    device: Device,
    dtype: DType,
    /// Architecture parameters the model was built from.
    pub config: ModelArchConfig,
}

impl LlamaModel {
    /// Build the model from a `VarBuilder` over the checkpoint tensors.
    pub fn load(vb: VarBuilder, cfg: &ModelArchConfig) -> Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let vb_model = vb.pp("model");

        let embed_tokens =
            embedding(cfg.vocab_size, cfg.hidden_size, vb_model.pp("embed_tokens"))?;
        let mut blocks = Vec::with_capacity(cfg.num_hidden_layers);
        for layer in 0..cfg.num_hidden_layers {
            blocks.push(Block::load(vb_model.pp(format!("layers.{layer}")), cfg, layer)?);
        }
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_model.pp("norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };
        let rope = RotaryEmbedding::new(cfg, dtype, &device)?;

        Ok(Self {
            embed_tokens,
            blocks,
            norm,
            lm_head,
            rope,
            device,
            dtype,
            config: cfg.clone(),
        })
    }

    /// Fresh per-request KV cache.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.blocks.len())
    }

    /// The device this model lives on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// One decoding step: `input_ids` is `(batch, seq)`, `pos` the absolute
    /// position of its first token. Returns next-token logits for the last
    /// position as an f32 tensor of shape `(batch, vocab)`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        pos: usize,
        cache: &mut KvCache,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mut xs = self.embed_tokens.forward(input_ids)?;
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, pos, &self.device, self.dtype)?)
        } else {
            None
        };
        for (layer, block) in self.blocks.iter().enumerate() {
            xs = block.forward(&xs, &self.rope, pos, mask.as_ref(), cache, layer, adapter)?;
        }
        let xs = self.norm.forward(&xs)?;
        let last = xs.i((.., seq_len - 1..))?;
        let logits = self.lm_head.forward(&last)?;
        logits.squeeze(1)?.to_dtype(DType::F32)
    }
}

/// Additive causal mask of shape `(seq, seq + offset)`: a query at relative
/// position `i` may attend to absolute positions `<= offset + i`.
fn causal_mask(seq_len: usize, offset: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let total = seq_len + offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > offset + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, total), device)?.to_dtype(dtype)
}
