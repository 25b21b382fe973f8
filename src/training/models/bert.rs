//! Trainable BERT encoder
//!
//! Every operation is composed from basic tensor ops (matmul, exp, mean, sqrt)
//! so that backpropagation works on every backend, including the fused layer
//! norm and softmax paths that have no backward implementation in candle_nn.
//! Parameters live in a `VarMap`; pretrained weights are copied into it by
//! [`load_pretrained`].
//!
//! RoBERTa-family checkpoints share the layout. Their position ids start at
//! `pad_token_id + 1`, which [`BertModel::forward`] handles from `model_type`.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Softmax from basic ops: exp(x - max(x)) / sum(exp(x - max(x)))
fn softmax(x: &Tensor, dim: D) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    let exp_x = x.broadcast_sub(&max)?.exp()?;
    let sum_exp = exp_x.sum_keepdim(dim)?;
    Ok(exp_x.broadcast_div(&sum_exp)?)
}

/// Dropout whose masks come from a seeded host RNG
///
/// The CPU backend cannot be seeded, so masks are sampled here and uploaded.
#[derive(Debug)]
pub struct SeededDropout {
    rng: Mutex<StdRng>,
}

impl SeededDropout {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Restart the mask sequence from `seed`
    pub fn reseed(&self, seed: u64) -> Result<()> {
        let mut rng = self.rng.lock().map_err(|_| anyhow!("Dropout RNG lock poisoned"))?;
        *rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    /// Zero each element with probability `p`, scale the rest by 1/(1-p)
    pub fn apply(&self, x: &Tensor, p: f64) -> Result<Tensor> {
        if p <= 0.0 {
            return Ok(x.clone());
        }
        if p >= 1.0 {
            return Ok(x.zeros_like()?);
        }
        let scale = (1.0 / (1.0 - p)) as f32;
        let mask: Vec<f32> = {
            let mut rng = self.rng.lock().map_err(|_| anyhow!("Dropout RNG lock poisoned"))?;
            (0..x.elem_count())
                .map(|_| if rng.gen::<f64>() < p { 0.0 } else { scale })
                .collect()
        };
        let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
        Ok(x.mul(&mask)?)
    }
}

fn dropout(x: &Tensor, p: f64, rng: Option<&SeededDropout>) -> Result<Tensor> {
    match rng {
        Some(rng) => rng.apply(x, p),
        None => Ok(x.clone()),
    }
}

/// Layer normalization: (x - mean) / sqrt(var + eps) * weight + bias
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    pub fn load(vb: VarBuilder, hidden_size: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let diff = x.broadcast_sub(&mean)?;
        let variance = diff.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (variance + self.eps)?.sqrt()?;
        let normalized = diff.broadcast_div(&std)?;
        Ok(normalized.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Feed-forward activation, `hidden_act` in `config.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    /// Exact erf-based GELU
    #[default]
    Gelu,
    #[serde(alias = "gelu_new", alias = "gelu_pytorch_tanh", alias = "gelu_fast")]
    GeluApproximate,
    Relu,
}

impl HiddenAct {
    fn forward(self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Gelu => x.gelu_erf()?,
            Self::GeluApproximate => x.gelu()?,
            Self::Relu => x.relu()?,
        })
    }
}

/// BERT configuration as found in `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub hidden_act: HiddenAct,
    #[serde(default)]
    pub pad_token_id: usize,
    #[serde(default)]
    pub model_type: Option<String>,
}

fn default_dropout() -> f64 {
    0.1
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl BertConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.model_type.as_deref() {
            None | Some("bert") | Some("roberta") | Some("xlm-roberta") | Some("camembert") => {}
            Some(other) => bail!("Unsupported model type '{}'", other),
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        if self.max_sequence_length() == 0 {
            bail!(
                "max_position_embeddings {} leaves no positions after pad_token_id {}",
                self.max_position_embeddings,
                self.pad_token_id
            );
        }
        Ok(())
    }

    /// RoBERTa-family position ids start after the padding index
    pub fn offsets_positions(&self) -> bool {
        matches!(
            self.model_type.as_deref(),
            Some("roberta") | Some("xlm-roberta") | Some("camembert")
        )
    }

    /// Longest token sequence the position embeddings can address
    pub fn max_sequence_length(&self) -> usize {
        if self.offsets_positions() {
            self.max_position_embeddings.saturating_sub(self.pad_token_id + 1)
        } else {
            self.max_position_embeddings
        }
    }
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            hidden_act: HiddenAct::Gelu,
            pad_token_id: 0,
            model_type: Some("bert".to_string()),
        }
    }
}

/// Word + position + token type embeddings
#[derive(Debug)]
struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    dropout: f64,
}

impl BertEmbeddings {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: candle_nn::embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: candle_nn::embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: LayerNorm::load(vb.pp("LayerNorm"), config.hidden_size, config.layer_norm_eps)?,
            dropout: config.hidden_dropout_prob,
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        token_type_ids: &Tensor,
        rng: Option<&SeededDropout>,
    ) -> Result<Tensor> {
        let word_embeds = self.word_embeddings.forward(input_ids)?;
        let position_embeds = self.position_embeddings.forward(position_ids)?;
        let token_type_embeds = self.token_type_embeddings.forward(token_type_ids)?;

        let embeddings = word_embeds
            .broadcast_add(&position_embeds)?
            .broadcast_add(&token_type_embeds)?;
        let embeddings = self.layer_norm.forward(&embeddings)?;
        dropout(&embeddings, self.dropout, rng)
    }
}

#[derive(Debug)]
struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_attention_heads: usize,
    attention_head_size: usize,
    dropout: f64,
}

impl BertSelfAttention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, vb.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, vb.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, vb.pp("value"))?,
            num_attention_heads: config.num_attention_heads,
            attention_head_size: hidden / config.num_attention_heads,
            dropout: config.attention_probs_dropout_prob,
        })
    }

    /// [batch, seq, hidden] -> [batch, heads, seq, head_size]
    fn split_heads(&self, x: &Tensor, batch_size: usize, seq_len: usize) -> Result<Tensor> {
        let x = x.reshape((batch_size, seq_len, self.num_attention_heads, self.attention_head_size))?;
        Ok(x.transpose(1, 2)?.contiguous()?)
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        rng: Option<&SeededDropout>,
    ) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let query = self.split_heads(&self.query.forward(hidden_states)?, batch_size, seq_len)?;
        let key = self.split_heads(&self.key.forward(hidden_states)?, batch_size, seq_len)?;
        let value = self.split_heads(&self.value.forward(hidden_states)?, batch_size, seq_len)?;

        let key_t = key.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let scale = 1.0 / (self.attention_head_size as f64).sqrt();
        let scores = (query.matmul(&key_t)? * scale)?;
        // mask is [batch, 1, 1, seq]: 0 for tokens, -10000 for padding
        let scores = scores.broadcast_add(attention_mask)?;

        let probs = softmax(&scores, D::Minus1)?;
        let probs = dropout(&probs, self.dropout, rng)?;

        let context = probs.matmul(&value)?.transpose(1, 2)?.contiguous()?;
        Ok(context.reshape((batch_size, seq_len, self.num_attention_heads * self.attention_head_size))?)
    }
}

/// Dense projection, dropout, residual add and layer norm
#[derive(Debug)]
struct BertResidual {
    dense: Linear,
    layer_norm: LayerNorm,
    dropout: f64,
}

impl BertResidual {
    fn load(vb: VarBuilder, in_dim: usize, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            dense: candle_nn::linear(in_dim, config.hidden_size, vb.pp("dense"))?,
            layer_norm: LayerNorm::load(vb.pp("LayerNorm"), config.hidden_size, config.layer_norm_eps)?,
            dropout: config.hidden_dropout_prob,
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        rng: Option<&SeededDropout>,
    ) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        let hidden_states = dropout(&hidden_states, self.dropout, rng)?;
        self.layer_norm.forward(&(hidden_states + input_tensor)?)
    }
}

#[derive(Debug)]
struct BertLayer {
    attention: BertSelfAttention,
    attention_output: BertResidual,
    intermediate: Linear,
    activation: HiddenAct,
    output: BertResidual,
}

impl BertLayer {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let attention_vb = vb.pp("attention");
        Ok(Self {
            attention: BertSelfAttention::load(attention_vb.pp("self"), config)?,
            attention_output: BertResidual::load(attention_vb.pp("output"), config.hidden_size, config)?,
            intermediate: candle_nn::linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            activation: config.hidden_act,
            output: BertResidual::load(vb.pp("output"), config.intermediate_size, config)?,
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        rng: Option<&SeededDropout>,
    ) -> Result<Tensor> {
        let self_output = self.attention.forward(hidden_states, attention_mask, rng)?;
        let attention_output = self.attention_output.forward(&self_output, hidden_states, rng)?;
        let intermediate = self.activation.forward(&self.intermediate.forward(&attention_output)?)?;
        self.output.forward(&intermediate, &attention_output, rng)
    }
}

/// BERT encoder returning the last hidden states
#[derive(Debug)]
pub struct BertModel {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    config: BertConfig,
    dropout: SeededDropout,
}

impl BertModel {
    /// Build the graph; parameters are created in (or fetched from) the backing `VarMap`
    pub fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let embeddings = BertEmbeddings::load(vb.pp("embeddings"), config)?;
        let vb_layers = vb.pp("encoder").pp("layer");
        let layers = (0..config.num_hidden_layers)
            .map(|i| BertLayer::load(vb_layers.pp(i.to_string()), config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embeddings,
            layers,
            config: config.clone(),
            dropout: SeededDropout::new(0),
        })
    }

    /// Reseed the dropout masks used by training forward passes
    pub fn set_seed(&self, seed: u64) -> Result<()> {
        self.dropout.reseed(seed)
    }

    /// [batch, seq] (1 = token, 0 = pad) -> [batch, 1, 1, seq] additive mask
    fn extended_attention_mask(attention_mask: &Tensor) -> Result<Tensor> {
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(1)?.unsqueeze(1)?;
        Ok(((1.0 - mask)? * -10000.0)?)
    }

    /// [1, seq] for BERT; [batch, seq] counting from `pad_token_id + 1` over
    /// real tokens for the RoBERTa family, with padding at `pad_token_id`
    fn position_ids(&self, attention_mask: &Tensor) -> Result<Tensor> {
        let (_batch_size, seq_len) = attention_mask.dims2()?;
        if !self.config.offsets_positions() {
            return Ok(Tensor::arange(0u32, seq_len as u32, attention_mask.device())?.unsqueeze(0)?);
        }
        let mask = attention_mask.to_dtype(DType::F32)?;
        let positions = (mask.cumsum(1)? * &mask)?;
        Ok((positions + self.config.pad_token_id as f64)?.to_dtype(DType::U32)?)
    }

    /// Last hidden states [batch, seq, hidden]
    ///
    /// Dropout is active only when `train` is set.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let rng = train.then_some(&self.dropout);
        let token_type_ids = input_ids.zeros_like()?;
        let position_ids = self.position_ids(attention_mask)?;
        let mut hidden_states = self.embeddings.forward(input_ids, &position_ids, &token_type_ids, rng)?;
        let mask = Self::extended_attention_mask(attention_mask)?;

        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &mask, rng)?;
        }
        Ok(hidden_states)
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }
}

/// Prefix in front of `embeddings.word_embeddings.weight` in a checkpoint
/// (`""` for a bare encoder, `"bert."` for task-head checkpoints).
fn detect_prefix<'a>(names: impl Iterator<Item = &'a String>) -> Option<String> {
    const ANCHOR: &str = "embeddings.word_embeddings.weight";
    names
        .filter_map(|name| name.strip_suffix(ANCHOR))
        .min_by_key(|prefix| prefix.len())
        .map(str::to_string)
}

fn lookup<'a>(tensors: &'a HashMap<String, Tensor>, prefix: &str, name: &str) -> Option<&'a Tensor> {
    let full = format!("{prefix}{name}");
    if let Some(t) = tensors.get(&full) {
        return Some(t);
    }
    // TensorFlow-era checkpoints name layer norm parameters gamma/beta
    let legacy = if let Some(stem) = full.strip_suffix("LayerNorm.weight") {
        format!("{stem}LayerNorm.gamma")
    } else if let Some(stem) = full.strip_suffix("LayerNorm.bias") {
        format!("{stem}LayerNorm.beta")
    } else {
        return None;
    };
    tensors.get(&legacy)
}

/// Copy weights from a safetensors file into every variable of `varmap`
///
/// Tensors are cast to f32. A variable without a matching tensor, or with a
/// mismatched shape, is an error; extra tensors (pooler, heads) are ignored.
pub fn load_pretrained(varmap: &VarMap, weights: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(weights, device)
        .with_context(|| format!("Failed to read weights: {:?}", weights))?;
    let prefix = detect_prefix(tensors.keys())
        .ok_or_else(|| anyhow!("No BERT embeddings found in {:?}", weights))?;
    if !prefix.is_empty() {
        tracing::debug!("Stripping weight prefix '{}'", prefix);
    }

    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("Parameter store lock poisoned"))?;

    let mut missing = Vec::new();
    for (name, var) in data.iter() {
        let Some(tensor) = lookup(&tensors, &prefix, name) else {
            missing.push(name.clone());
            continue;
        };
        if tensor.dims() != var.dims() {
            bail!(
                "Shape mismatch for {}: checkpoint {:?}, model {:?}",
                name,
                tensor.dims(),
                var.dims()
            );
        }
        var.set(&tensor.to_dtype(DType::F32)?)?;
    }

    if !missing.is_empty() {
        missing.sort();
        bail!("Weights missing from {:?}: {}", weights, missing.join(", "));
    }

    tracing::debug!("Loaded {} tensors from {:?}", data.len(), weights);
    Ok(())
}
