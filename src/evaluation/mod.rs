//! Evaluation metrics
//!
//! Retrieval metrics (accuracy, precision, recall, MRR, nDCG, MAP) and the
//! information-retrieval evaluator that ranks a corpus with an embedding model.

pub mod ir;
pub mod retrieval;

// Re-exports
pub use ir::{EvaluationResult, InformationRetrievalEvaluator, IrEvaluatorConfig, ScoreFunction};
pub use retrieval::{MetricCutoffs, QueryResult, RetrievalEvaluator, RetrievalMetrics};
