//! Information-retrieval evaluator
//!
//! Embeds a corpus and a set of queries with the model under training, ranks
//! the corpus for every query and reports the retrieval metrics of
//! [`super::retrieval`] per score function.

use anyhow::{bail, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use super::retrieval::{MetricCutoffs, QueryResult, RetrievalEvaluator};
use crate::data::{RelevanceMap, TextMap};
use crate::training::models::{normalize_embeddings, EmbeddingModel};

/// Similarity used to rank corpus entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreFunction {
    Cosine,
    Dot,
}

impl ScoreFunction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Dot => "dot",
        }
    }

    /// Scores [queries, corpus]
    pub fn scores(self, queries: &Tensor, corpus: &Tensor) -> Result<Tensor> {
        match self {
            Self::Cosine => {
                let q = normalize_embeddings(queries)?;
                let c = normalize_embeddings(corpus)?;
                Ok(q.matmul(&c.t()?)?)
            }
            Self::Dot => Ok(queries.matmul(&corpus.t()?)?),
        }
    }
}

impl std::str::FromStr for ScoreFunction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" | "cos_sim" => Ok(Self::Cosine),
            "dot" | "dot_score" => Ok(Self::Dot),
            _ => bail!("Invalid score function: {}. Valid options: cosine, dot", s),
        }
    }
}

/// Evaluator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrEvaluatorConfig {
    /// Prefix of every metric key, usually the model name
    pub name: String,
    pub score_functions: Vec<ScoreFunction>,
    /// Score function of the primary metric; cosine when present, else the first
    pub main_score_function: Option<ScoreFunction>,
    pub cutoffs: MetricCutoffs,
    /// Texts embedded per forward pass
    pub batch_size: usize,
    /// Corpus rows scored against all queries at once
    pub corpus_chunk_size: usize,
}

impl Default for IrEvaluatorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            score_functions: vec![ScoreFunction::Cosine],
            main_score_function: None,
            cutoffs: MetricCutoffs::default(),
            batch_size: 32,
            corpus_chunk_size: 50_000,
        }
    }
}

impl IrEvaluatorConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn key_prefix(&self) -> String {
        if self.name.is_empty() {
            String::new()
        } else {
            format!("{}_", self.name)
        }
    }

    fn main_function(&self) -> ScoreFunction {
        self.main_score_function.unwrap_or_else(|| {
            if self.score_functions.contains(&ScoreFunction::Cosine) {
                ScoreFunction::Cosine
            } else {
                self.score_functions.first().copied().unwrap_or(ScoreFunction::Cosine)
            }
        })
    }

    /// Key of the metric used for model selection, e.g. `bge_cosine_ndcg@10`
    pub fn primary_metric(&self) -> String {
        let k = self.cutoffs.ndcg_at_k.iter().copied().max().unwrap_or(10);
        format!("{}{}_ndcg@{}", self.key_prefix(), self.main_function().name(), k)
    }
}

/// Output of one evaluation pass
#[derive(Debug, Clone, Default)]
pub struct EvaluationResult {
    /// `{name}_{score_function}_{metric}@{k}` -> value
    pub metrics: BTreeMap<String, f64>,
    pub primary_metric: String,
}

impl EvaluationResult {
    pub fn primary_score(&self) -> Option<f64> {
        self.metrics.get(&self.primary_metric).copied()
    }

    /// Metrics re-keyed with a prefix, e.g. `eval_`
    pub fn prefixed(&self, prefix: &str) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|(k, v)| (format!("{prefix}{k}"), *v))
            .collect()
    }
}

/// Ranks a fixed corpus for a fixed set of queries
pub struct InformationRetrievalEvaluator {
    query_ids: Vec<String>,
    query_texts: Vec<String>,
    corpus_ids: Vec<String>,
    corpus_texts: Vec<String>,
    relevant_docs: RelevanceMap,
    config: IrEvaluatorConfig,
    metrics: RetrievalEvaluator,
}

impl InformationRetrievalEvaluator {
    /// Queries without relevant documents are not evaluated
    pub fn new(
        queries: &TextMap,
        corpus: &TextMap,
        relevant_docs: &RelevanceMap,
        config: IrEvaluatorConfig,
    ) -> Self {
        let (query_ids, query_texts): (Vec<String>, Vec<String>) = queries
            .iter()
            .filter(|(id, _)| relevant_docs.get(*id).is_some_and(|docs| !docs.is_empty()))
            .map(|(id, text)| (id.clone(), text.clone()))
            .unzip();
        let (corpus_ids, corpus_texts): (Vec<String>, Vec<String>) = corpus
            .iter()
            .map(|(id, text)| (id.clone(), text.clone()))
            .unzip();

        if query_ids.len() < queries.len() {
            tracing::debug!(
                "{} of {} queries have no relevant documents and are skipped",
                queries.len() - query_ids.len(),
                queries.len()
            );
        }

        let metrics = RetrievalEvaluator::new(config.cutoffs.clone());
        Self {
            query_ids,
            query_texts,
            corpus_ids,
            corpus_texts,
            relevant_docs: relevant_docs.clone(),
            config,
            metrics,
        }
    }

    pub fn primary_metric(&self) -> String {
        self.config.primary_metric()
    }

    /// Embed, rank and score
    pub fn evaluate(&self, model: &dyn EmbeddingModel) -> Result<EvaluationResult> {
        let start = Instant::now();
        let mut result = EvaluationResult {
            metrics: BTreeMap::new(),
            primary_metric: self.primary_metric(),
        };
        if self.query_ids.is_empty() || self.corpus_ids.is_empty() {
            tracing::warn!("Nothing to evaluate: {} queries, {} corpus entries", self.query_ids.len(), self.corpus_ids.len());
            return Ok(result);
        }

        let query_embeddings = model.encode(&self.query_texts, self.config.batch_size)?;
        let corpus_embeddings = model.encode(&self.corpus_texts, self.config.batch_size)?;
        let top_k = self.config.cutoffs.max_k().min(self.corpus_ids.len());
        let prefix = self.config.key_prefix();

        for &score_fn in &self.config.score_functions {
            let rankings = self.rank(&query_embeddings, &corpus_embeddings, score_fn, top_k)?;
            let query_results: Vec<QueryResult> = self
                .query_ids
                .iter()
                .zip(rankings)
                .map(|(qid, ranked)| {
                    let retrieved = ranked.into_iter().map(|i| self.corpus_ids[i].clone()).collect();
                    let relevant = self.relevant_docs.get(qid).cloned().unwrap_or_default();
                    QueryResult::new(qid.clone(), retrieved, relevant)
                })
                .collect();

            let metrics = self.metrics.evaluate(&query_results);
            tracing::info!(
                "Score function {} on {} queries / {} docs:\n{}",
                score_fn.name(),
                metrics.num_queries,
                self.corpus_ids.len(),
                metrics
            );
            for (name, value) in metrics.values {
                result
                    .metrics
                    .insert(format!("{}{}_{}", prefix, score_fn.name(), name), value);
            }
        }

        tracing::debug!("Evaluation took {:.2}s", start.elapsed().as_secs_f64());
        Ok(result)
    }

    /// Corpus indices of the `top_k` best-scoring entries per query;
    /// equal scores keep corpus order
    fn rank(
        &self,
        queries: &Tensor,
        corpus: &Tensor,
        score_fn: ScoreFunction,
        top_k: usize,
    ) -> Result<Vec<Vec<usize>>> {
        let num_corpus = corpus.dim(0)?;
        let chunk_size = self.config.corpus_chunk_size.max(1);
        let mut candidates: Vec<Vec<(f32, usize)>> = vec![Vec::new(); queries.dim(0)?];

        let mut start = 0;
        while start < num_corpus {
            let len = chunk_size.min(num_corpus - start);
            let chunk = corpus.narrow(0, start, len)?;
            let scores = score_fn.scores(queries, &chunk)?.to_vec2::<f32>()?;

            for (row, list) in scores.into_iter().zip(candidates.iter_mut()) {
                list.extend(row.into_iter().enumerate().map(|(j, s)| (s, start + j)));
                list.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
                list.truncate(top_k);
            }
            start += len;
        }

        Ok(candidates
            .into_iter()
            .map(|list| list.into_iter().map(|(_, i)| i).collect())
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};

    impl InformationRetrievalEvaluator {
        /// Test-only: number of queries kept for evaluation
        fn num_queries(&self) -> usize {
            self.query_ids.len()
        }
    }

    /// Bag-of-letters embedding: one dimension per ASCII lowercase letter
    pub(crate) struct LetterModel {
        pub device: Device,
    }

    impl EmbeddingModel for LetterModel {
        fn encode(&self, texts: &[String], _batch_size: usize) -> Result<Tensor> {
            let mut data = Vec::with_capacity(texts.len() * 26);
            for text in texts {
                let mut row = [0f32; 26];
                for c in text.chars().filter(|c| c.is_ascii_lowercase()) {
                    row[(c as u8 - b'a') as usize] += 1.0;
                }
                data.extend_from_slice(&row);
            }
            if texts.is_empty() {
                return Ok(Tensor::zeros((0, 26), DType::F32, &self.device)?);
            }
            Ok(Tensor::from_vec(data, (texts.len(), 26), &self.device)?)
        }

        fn embedding_dim(&self) -> usize {
            26
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn maps() -> (TextMap, TextMap, RelevanceMap) {
        let corpus: TextMap = [("c1", "aaaa"), ("c2", "bbbb"), ("c3", "cccc")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let queries: TextMap = [("q1", "aa"), ("q2", "bc"), ("q3", "zz")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut relevant = RelevanceMap::new();
        relevant.insert("q1".to_string(), vec!["c1".to_string()]);
        relevant.insert("q2".to_string(), vec!["c3".to_string()]);
        (corpus, queries, relevant)
    }

    #[test]
    fn test_metric_keys_and_values() {
        let (corpus, queries, relevant) = maps();
        let evaluator =
            InformationRetrievalEvaluator::new(&queries, &corpus, &relevant, IrEvaluatorConfig::named("bge"));
        // q3 has no relevance entry
        assert_eq!(evaluator.num_queries(), 2);

        let model = LetterModel { device: Device::Cpu };
        let result = evaluator.evaluate(&model).unwrap();

        assert_eq!(result.primary_metric, "bge_cosine_ndcg@10");
        // q1 ranks c1 first; q2 ties c2/c3 and corpus order puts c2 first
        assert_eq!(result.metrics["bge_cosine_accuracy@1"], 0.5);
        assert_eq!(result.metrics["bge_cosine_accuracy@3"], 1.0);
        assert!((result.metrics["bge_cosine_mrr@10"] - 0.75).abs() < 1e-9);
        let expected_ndcg = (1.0 + 1.0 / 3f64.log2()) / 2.0;
        assert!((result.primary_score().unwrap() - expected_ndcg).abs() < 1e-6);
    }

    #[test]
    fn test_multiple_score_functions() {
        let (corpus, queries, relevant) = maps();
        let config = IrEvaluatorConfig {
            name: String::new(),
            score_functions: vec![ScoreFunction::Dot, ScoreFunction::Cosine],
            corpus_chunk_size: 1,
            ..Default::default()
        };
        let evaluator = InformationRetrievalEvaluator::new(&queries, &corpus, &relevant, config);
        let result = evaluator
            .evaluate(&LetterModel { device: Device::Cpu })
            .unwrap();

        assert_eq!(result.primary_metric, "cosine_ndcg@10");
        assert!(result.metrics.contains_key("dot_map@100"));
        assert!(result.metrics.contains_key("cosine_recall@10"));

        let prefixed = result.prefixed("eval_");
        assert!(prefixed.contains_key("eval_cosine_ndcg@10"));
    }

    #[test]
    fn test_score_function_from_str() {
        assert_eq!("cos_sim".parse::<ScoreFunction>().unwrap(), ScoreFunction::Cosine);
        assert!("l2".parse::<ScoreFunction>().is_err());
    }
}
