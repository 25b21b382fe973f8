//! # embedtune
//!
//! Contrastive fine-tuning of BERT-family sentence embedding models for
//! retrieval.
//!
//! ## Overview
//!
//! A run loads a training and a validation dataset in the
//! corpus/queries/relevant_docs layout, optionally mines one hard negative
//! per anchor, trains with the Multiple Negatives Ranking loss, evaluates
//! nDCG@10 on the validation set every epoch and keeps the best checkpoint.
//!
//! ## Architecture
//!
//! - `data` - Relevance datasets and training records
//! - `mining` - Hard negative mining with a result cache
//! - `training` - Encoder, loss, optimizer, trainer and checkpoints
//! - `evaluation` - Retrieval metrics and the IR evaluator
//! - `pipeline` - The end-to-end run
//! - `cli` - Command-line entry
//! - `utils` - Logging setup

pub mod cli;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod mining;
pub mod pipeline;
pub mod training;
pub mod utils;

// Re-export commonly used types
pub use anyhow::{Error, Result};
pub use error::{ConfigError, DatasetError};
