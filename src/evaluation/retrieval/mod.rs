//! Retrieval evaluation metrics
//!
//! Standard IR metrics over binary relevance:
//! - Accuracy@K: whether any relevant item is in the top K
//! - Precision@K / Recall@K
//! - MRR@K: reciprocal rank of the first relevant item within the top K
//! - NDCG@K: normalized discounted cumulative gain
//! - MAP@K: mean average precision over the top K

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Single query evaluation result
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub query_id: String,
    /// Retrieved document IDs in ranked order
    pub retrieved: Vec<String>,
    /// Relevant document IDs (ground truth)
    pub relevant: HashSet<String>,
}

impl QueryResult {
    pub fn new(query_id: impl Into<String>, retrieved: Vec<String>, relevant: Vec<String>) -> Self {
        Self {
            query_id: query_id.into(),
            retrieved,
            relevant: relevant.into_iter().collect(),
        }
    }

    fn hits_in_top_k(&self, k: usize) -> usize {
        self.retrieved
            .iter()
            .take(k)
            .filter(|r| self.relevant.contains(*r))
            .count()
    }

    /// Whether any relevant document is in the top K
    pub fn has_hit_at_k(&self, k: usize) -> bool {
        self.hits_in_top_k(k) > 0
    }

    /// Recall@K = |relevant ∩ retrieved@K| / |relevant|
    pub fn recall_at_k(&self, k: usize) -> f64 {
        if self.relevant.is_empty() {
            return 0.0;
        }
        self.hits_in_top_k(k) as f64 / self.relevant.len() as f64
    }

    /// Precision@K = |relevant ∩ retrieved@K| / K
    pub fn precision_at_k(&self, k: usize) -> f64 {
        if k == 0 {
            return 0.0;
        }
        self.hits_in_top_k(k) as f64 / k as f64
    }

    /// 1 / rank of the first relevant item within the top K, 0 if none
    pub fn reciprocal_rank_at_k(&self, k: usize) -> f64 {
        self.retrieved
            .iter()
            .take(k)
            .position(|doc| self.relevant.contains(doc))
            .map(|i| 1.0 / (i + 1) as f64)
            .unwrap_or(0.0)
    }

    /// DCG@K = Σ rel_i / log2(i + 1)
    pub fn dcg_at_k(&self, k: usize) -> f64 {
        self.retrieved
            .iter()
            .take(k)
            .enumerate()
            .filter(|(_, doc)| self.relevant.contains(*doc))
            .map(|(i, _)| 1.0 / (i as f64 + 2.0).log2())
            .sum()
    }

    /// DCG of the ideal ranking (all relevant docs first)
    pub fn idcg_at_k(&self, k: usize) -> f64 {
        let num_relevant = self.relevant.len().min(k);
        (0..num_relevant).map(|i| 1.0 / (i as f64 + 2.0).log2()).sum()
    }

    pub fn ndcg_at_k(&self, k: usize) -> f64 {
        let idcg = self.idcg_at_k(k);
        if idcg == 0.0 {
            return 0.0;
        }
        self.dcg_at_k(k) / idcg
    }

    /// AP@K = Σ Precision@i · rel(i) / min(K, |relevant|), over the top K
    pub fn average_precision_at_k(&self, k: usize) -> f64 {
        let denominator = self.relevant.len().min(k);
        if denominator == 0 {
            return 0.0;
        }

        let mut sum = 0.0;
        let mut relevant_count = 0;
        for (i, doc) in self.retrieved.iter().take(k).enumerate() {
            if self.relevant.contains(doc) {
                relevant_count += 1;
                sum += relevant_count as f64 / (i + 1) as f64;
            }
        }
        sum / denominator as f64
    }
}

/// Cutoffs at which each metric family is reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCutoffs {
    pub accuracy_at_k: Vec<usize>,
    pub precision_recall_at_k: Vec<usize>,
    pub mrr_at_k: Vec<usize>,
    pub ndcg_at_k: Vec<usize>,
    pub map_at_k: Vec<usize>,
}

impl Default for MetricCutoffs {
    fn default() -> Self {
        Self {
            accuracy_at_k: vec![1, 3, 5, 10],
            precision_recall_at_k: vec![1, 3, 5, 10],
            mrr_at_k: vec![10],
            ndcg_at_k: vec![10],
            map_at_k: vec![100],
        }
    }
}

impl MetricCutoffs {
    /// Largest cutoff; rankings never need to be longer than this
    pub fn max_k(&self) -> usize {
        self.accuracy_at_k
            .iter()
            .chain(&self.precision_recall_at_k)
            .chain(&self.mrr_at_k)
            .chain(&self.ndcg_at_k)
            .chain(&self.map_at_k)
            .copied()
            .max()
            .unwrap_or(0)
    }
}

/// Metrics averaged over queries, keyed `accuracy@1`, `ndcg@10`, ...
#[derive(Debug, Clone, Default)]
pub struct RetrievalMetrics {
    pub values: BTreeMap<String, f64>,
    pub num_queries: usize,
}

impl RetrievalMetrics {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

impl std::fmt::Display for RetrievalMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Retrieval Metrics ({} queries):", self.num_queries)?;
        for (name, value) in &self.values {
            writeln!(f, "  {}: {:.4}", name, value)?;
        }
        Ok(())
    }
}

/// Aggregates per-query results
#[derive(Debug, Clone, Default)]
pub struct RetrievalEvaluator {
    cutoffs: MetricCutoffs,
}

impl RetrievalEvaluator {
    pub fn new(cutoffs: MetricCutoffs) -> Self {
        Self { cutoffs }
    }

    pub fn cutoffs(&self) -> &MetricCutoffs {
        &self.cutoffs
    }

    /// Metrics for a single query
    pub fn evaluate_query(&self, result: &QueryResult) -> BTreeMap<String, f64> {
        let c = &self.cutoffs;
        let mut values = BTreeMap::new();

        for &k in &c.accuracy_at_k {
            let hit = if result.has_hit_at_k(k) { 1.0 } else { 0.0 };
            values.insert(format!("accuracy@{k}"), hit);
        }
        for &k in &c.precision_recall_at_k {
            values.insert(format!("precision@{k}"), result.precision_at_k(k));
            values.insert(format!("recall@{k}"), result.recall_at_k(k));
        }
        for &k in &c.mrr_at_k {
            values.insert(format!("mrr@{k}"), result.reciprocal_rank_at_k(k));
        }
        for &k in &c.ndcg_at_k {
            values.insert(format!("ndcg@{k}"), result.ndcg_at_k(k));
        }
        for &k in &c.map_at_k {
            values.insert(format!("map@{k}"), result.average_precision_at_k(k));
        }
        values
    }

    /// Evaluate multiple query results and average each metric
    pub fn evaluate(&self, results: &[QueryResult]) -> RetrievalMetrics {
        if results.is_empty() {
            return RetrievalMetrics::default();
        }

        let n = results.len() as f64;
        let mut values: BTreeMap<String, f64> = BTreeMap::new();
        for result in results {
            for (name, value) in self.evaluate_query(result) {
                *values.entry(name).or_default() += value;
            }
        }
        for value in values.values_mut() {
            *value /= n;
        }

        RetrievalMetrics {
            values,
            num_queries: results.len(),
        }
    }
}
