//! Loss functions for training embedding models
//!
//! Multiple Negatives Ranking loss: for every anchor the matching positive is
//! the target class and every other positive in the batch, plus every mined
//! negative, is a negative.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use super::dataset::Batch;
use super::models::{cosine_similarity, SentenceEncoder};

/// Similarity used to build the logits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityFn {
    #[default]
    Cosine,
    Dot,
}

/// Loss configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Multiplier applied to similarities before the softmax (inverse temperature)
    pub scale: f64,
    pub similarity: SimilarityFn,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            scale: 20.0,
            similarity: SimilarityFn::Cosine,
        }
    }
}

/// Multiple Negatives Ranking loss with in-batch negatives
#[derive(Debug, Clone, Default)]
pub struct MultipleNegativesRankingLoss {
    config: LossConfig,
}

impl MultipleNegativesRankingLoss {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Loss from embeddings
    ///
    /// * `anchors` - [batch, hidden]
    /// * `positives` - [batch, hidden]
    /// * `negatives` - [batch, hidden], optional
    pub fn forward(&self, anchors: &Tensor, positives: &Tensor, negatives: Option<&Tensor>) -> Result<Tensor> {
        let batch_size = anchors.dim(0)?;
        if positives.dim(0)? != batch_size {
            bail!(
                "Anchor/positive count mismatch: {} vs {}",
                batch_size,
                positives.dim(0)?
            );
        }

        // candidates: [batch (+ batch), hidden]
        let candidates = match negatives {
            Some(neg) => Tensor::cat(&[positives, neg], 0)?,
            None => positives.clone(),
        };

        let scores = match self.config.similarity {
            SimilarityFn::Cosine => cosine_similarity(anchors, &candidates)?,
            SimilarityFn::Dot => anchors.matmul(&candidates.t()?)?,
        };
        let scores = (scores * self.config.scale)?;

        // the positive for anchor i sits at column i
        let labels = Tensor::arange(0u32, batch_size as u32, anchors.device())?;
        cross_entropy(&scores, &labels)
    }

    /// Encode a batch with `model` in training mode and compute the loss
    pub fn forward_batch(&self, model: &SentenceEncoder, batch: &Batch) -> Result<Tensor> {
        let anchors = model.forward(&batch.anchors, true)?;
        let positives = model.forward(&batch.positives, true)?;
        let negatives = if batch.has_negatives() {
            Some(model.forward(&batch.negatives, true)?)
        } else {
            None
        };

        tracing::trace!(
            "Loss inputs: anchors {:?}, positives {:?}, negatives {:?}",
            anchors.dims(),
            positives.dims(),
            negatives.as_ref().map(|n| n.dims().to_vec())
        );

        self.forward(&anchors, &positives, negatives.as_ref())
    }
}

fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_softmax = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    Ok(candle_nn::loss::nll(&log_softmax, &labels.to_dtype(DType::U32)?)?)
}
