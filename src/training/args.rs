//! Training arguments
//!
//! Every knob of a fine-tuning run in one serializable struct. The values
//! are written to `training_args.json` next to the saved model.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::dataset::BatchSamplerKind;
use super::optimizer::{AdamWConfig, SchedulerKind};
use crate::error::ConfigError;

/// When to evaluate or save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStrategy {
    No,
    Steps,
    #[default]
    Epoch,
}

impl std::str::FromStr for IntervalStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "no" => Ok(Self::No),
            "steps" => Ok(Self::Steps),
            "epoch" => Ok(Self::Epoch),
            _ => Err(anyhow::anyhow!(
                "Invalid interval strategy: {}. Valid options: no, steps, epoch",
                s
            )),
        }
    }
}

/// Optimizer choice; only AdamW is implemented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adamw,
}

/// Training arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArguments {
    /// Checkpoints go under this directory and the final model is saved to it
    pub output_dir: PathBuf,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub warmup_ratio: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,
    pub lr_scheduler_type: SchedulerKind,
    pub optim: OptimizerKind,
    /// Reduced-precision f32 matmuls (CUDA only)
    pub tf32: bool,
    /// Accepted for compatibility; weights and activations stay f32
    pub bf16: bool,
    pub batch_sampler: BatchSamplerKind,
    pub eval_strategy: IntervalStrategy,
    pub eval_steps: Option<usize>,
    pub save_strategy: IntervalStrategy,
    pub save_steps: Option<usize>,
    pub logging_steps: usize,
    /// Maximum number of checkpoints kept on disk; `None` keeps all
    pub save_total_limit: Option<usize>,
    pub load_best_model_at_end: bool,
    /// Metric key used to pick the best checkpoint, e.g. `eval_model_cosine_ndcg@10`
    pub metric_for_best_model: Option<String>,
    /// Derived from the metric name when unset: losses are minimized
    pub greater_is_better: Option<bool>,
    pub seed: u64,
    /// Truncation length; the model's own setting is used when unset
    pub max_seq_length: Option<usize>,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            num_train_epochs: 5,
            per_device_train_batch_size: 2,
            per_device_eval_batch_size: 4,
            gradient_accumulation_steps: 2,
            warmup_ratio: 0.1,
            learning_rate: 2e-5,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            lr_scheduler_type: SchedulerKind::Cosine,
            optim: OptimizerKind::Adamw,
            tf32: true,
            bf16: true,
            batch_sampler: BatchSamplerKind::NoDuplicates,
            eval_strategy: IntervalStrategy::Epoch,
            eval_steps: None,
            save_strategy: IntervalStrategy::Epoch,
            save_steps: None,
            logging_steps: 10,
            save_total_limit: Some(3),
            load_best_model_at_end: true,
            metric_for_best_model: None,
            greater_is_better: None,
            seed: 42,
            max_seq_length: None,
        }
    }
}

impl TrainingArguments {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    /// Metric used for best-model selection, `eval_`-prefixed
    pub fn best_metric_key(&self) -> String {
        let metric = self.metric_for_best_model.as_deref().unwrap_or("loss");
        if metric.starts_with("eval_") {
            metric.to_string()
        } else {
            format!("eval_{}", metric)
        }
    }

    /// Whether a higher value of the best-model metric is better
    pub fn higher_is_better(&self) -> bool {
        self.greater_is_better
            .unwrap_or_else(|| !self.best_metric_key().ends_with("loss"))
    }

    /// Optimizer updates per epoch for `num_batches` micro-batches
    pub fn steps_per_epoch(&self, num_batches: usize) -> usize {
        let accumulation = self.gradient_accumulation_steps.max(1);
        // a trailing partial accumulation is flushed at epoch end
        (num_batches + accumulation - 1) / accumulation
    }

    pub fn adamw(&self) -> AdamWConfig {
        AdamWConfig {
            lr: self.learning_rate,
            beta1: self.adam_beta1,
            beta2: self.adam_beta2,
            eps: self.adam_epsilon,
            weight_decay: self.weight_decay,
        }
    }

    /// Reject combinations the trainer cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_train_epochs == 0 {
            return Err(ConfigError::invalid_value("num_train_epochs", "0", "must be at least 1"));
        }
        if self.per_device_train_batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "per_device_train_batch_size",
                "0",
                "must be at least 1",
            ));
        }
        if self.per_device_eval_batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "per_device_eval_batch_size",
                "0",
                "must be at least 1",
            ));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(ConfigError::invalid_value(
                "gradient_accumulation_steps",
                "0",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(ConfigError::invalid_value(
                "warmup_ratio",
                self.warmup_ratio.to_string(),
                "must be within [0, 1]",
            ));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(ConfigError::invalid_value(
                "learning_rate",
                self.learning_rate.to_string(),
                "must be positive",
            ));
        }
        if self.eval_strategy == IntervalStrategy::Steps && !matches!(self.eval_steps, Some(n) if n > 0) {
            return Err(ConfigError::invalid_value(
                "eval_steps",
                format!("{:?}", self.eval_steps),
                "required when eval_strategy is steps",
            ));
        }
        if self.save_strategy == IntervalStrategy::Steps && !matches!(self.save_steps, Some(n) if n > 0) {
            return Err(ConfigError::invalid_value(
                "save_steps",
                format!("{:?}", self.save_steps),
                "required when save_strategy is steps",
            ));
        }
        if self.load_best_model_at_end {
            if self.eval_strategy == IntervalStrategy::No {
                return Err(ConfigError::invalid_value(
                    "load_best_model_at_end",
                    "true",
                    "needs an evaluation strategy",
                ));
            }
            if self.eval_strategy != self.save_strategy {
                return Err(ConfigError::invalid_value(
                    "load_best_model_at_end",
                    "true",
                    "eval_strategy and save_strategy must match",
                ));
            }
            if self.save_strategy == IntervalStrategy::Steps && self.save_steps != self.eval_steps {
                return Err(ConfigError::invalid_value(
                    "load_best_model_at_end",
                    "true",
                    "save_steps must equal eval_steps",
                ));
            }
        }
        Ok(())
    }
}
