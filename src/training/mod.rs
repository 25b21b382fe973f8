//! Contrastive fine-tuning of sentence encoders
//!
//! Builds a trainable BERT encoder from basic candle ops so that every
//! parameter receives gradients, and drives it with an in-batch
//! negatives loss.
//!
//! For GPU support:
//! ```bash
//! cargo build --features cuda    # NVIDIA GPU
//! cargo build --features metal   # Apple GPU
//! ```
//!
//! # Modules
//!
//! - `device` - CPU/CUDA/Metal device selection
//! - `hub` - local model directories and HuggingFace Hub downloads
//! - `models` - BERT encoder, pooling and tokenizer
//! - `loss` - Multiple Negatives Ranking loss
//! - `optimizer` - AdamW, gradient accumulation and LR schedules
//! - `dataset` - pair datasets and batch samplers
//! - `args` - training arguments
//! - `checkpoint` - checkpoint rotation and best-model tracking
//! - `trainer` - training loop

pub mod args;
pub mod checkpoint;
pub mod dataset;
pub mod device;
pub mod hub;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod trainer;

// Re-exports
pub use args::{IntervalStrategy, TrainingArguments};
pub use checkpoint::{CheckpointManager, TrainerState};
pub use dataset::{BatchSamplerKind, PairDataset};
pub use device::{select_device, DevicePreference};
pub use hub::{resolve_model, ModelPath};
pub use loss::{LossConfig, MultipleNegativesRankingLoss};
pub use models::{EmbeddingModel, SentenceEncoder};
pub use optimizer::{AdamW, AdamWConfig, SchedulerKind};
pub use trainer::{TrainOutput, Trainer};
