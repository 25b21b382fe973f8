//! Token-to-sentence pooling

use anyhow::{Context, Result};
use candle_core::{Tensor, D};
use serde::Deserialize;
use std::path::Path;

/// Pooling strategies for converting hidden states to sentence embeddings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PoolingStrategy {
    /// Mean pooling over non-padding tokens
    #[default]
    Mean,
    /// First ([CLS]) token
    Cls,
    /// Max pooling over non-padding tokens
    Max,
}

impl std::fmt::Display for PoolingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Cls => write!(f, "cls"),
            Self::Max => write!(f, "max"),
        }
    }
}

/// `1_Pooling/config.json` of a sentence-embedding model directory
#[derive(Debug, Clone, Default, Deserialize)]
struct PoolingConfig {
    #[serde(default)]
    pooling_mode_cls_token: bool,
    #[serde(default)]
    pooling_mode_mean_tokens: bool,
    #[serde(default)]
    pooling_mode_max_tokens: bool,
}

impl PoolingStrategy {
    /// Read the pooling mode; a file with no mode set means mean pooling
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pooling config: {:?}", path))?;
        let config: PoolingConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pooling config: {:?}", path))?;

        Ok(if config.pooling_mode_cls_token {
            Self::Cls
        } else if config.pooling_mode_max_tokens && !config.pooling_mode_mean_tokens {
            Self::Max
        } else {
            Self::Mean
        })
    }

    /// The `1_Pooling/config.json` body describing this strategy
    pub fn to_config_json(self, embedding_dimension: usize) -> serde_json::Value {
        serde_json::json!({
            "word_embedding_dimension": embedding_dimension,
            "pooling_mode_cls_token": self == Self::Cls,
            "pooling_mode_mean_tokens": self == Self::Mean,
            "pooling_mode_max_tokens": self == Self::Max,
            "pooling_mode_mean_sqrt_len_tokens": false,
        })
    }
}

/// Pool [batch, seq, hidden] hidden states into [batch, hidden]
pub fn apply_pooling(
    hidden_states: &Tensor,
    attention_mask: &Tensor,
    strategy: PoolingStrategy,
) -> Result<Tensor> {
    match strategy {
        PoolingStrategy::Mean => mean_pool(hidden_states, attention_mask),
        PoolingStrategy::Cls => Ok(hidden_states.narrow(1, 0, 1)?.squeeze(1)?),
        PoolingStrategy::Max => max_pool(hidden_states, attention_mask),
    }
}

fn mean_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.unsqueeze(2)?.to_dtype(hidden_states.dtype())?;
    let sum = hidden_states.broadcast_mul(&mask)?.sum(1)?;
    let count = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    Ok(sum.broadcast_div(&count)?)
}

fn max_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.unsqueeze(2)?.to_dtype(hidden_states.dtype())?;
    // padding positions get -1e9 so they never win the max
    let penalty = ((1.0 - &mask)? * -1e9)?;
    let masked = hidden_states.broadcast_mul(&mask)?.broadcast_add(&penalty)?;
    Ok(masked.max(1)?)
}

/// Normalize embeddings to unit length
pub fn normalize_embeddings(embeddings: &Tensor) -> Result<Tensor> {
    let norm = embeddings.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(embeddings.broadcast_div(&norm.clamp(1e-12, f64::MAX)?)?)
}

/// Pairwise cosine similarity [n, d] x [m, d] -> [n, m]
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_norm = normalize_embeddings(a)?;
    let b_norm = normalize_embeddings(b)?;
    Ok(a_norm.matmul(&b_norm.t()?)?)
}
