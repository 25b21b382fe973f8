//! Relevance datasets and training records
//!
//! A relevance dataset is a JSON document with three maps:
//!
//! ```json
//! {
//!   "corpus":        {"c1": "passage text", ...},
//!   "queries":       {"q1": "question text", ...},
//!   "relevant_docs": {"q1": ["c1", ...], ...}
//! }
//! ```
//!
//! Maps are held as `BTreeMap`s so that every pass over `relevant_docs`
//! visits queries in the same (lexicographic) order from run to run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{DatasetError, DatasetMap};

/// Map from id to text
pub type TextMap = BTreeMap<String, String>;

/// Map from query id to relevant corpus ids
pub type RelevanceMap = BTreeMap<String, Vec<String>>;

/// One contrastive training example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// Query text
    pub anchor: String,
    /// Text relevant to the anchor
    pub positive: String,
    /// Mined hard negative, present only after mining
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative: Option<String>,
}

impl TrainingRecord {
    pub fn new(anchor: impl Into<String>, positive: impl Into<String>) -> Self {
        Self {
            anchor: anchor.into(),
            positive: positive.into(),
            negative: None,
        }
    }

    pub fn with_negative(mut self, negative: impl Into<String>) -> Self {
        self.negative = Some(negative.into());
        self
    }

    /// All texts of this record, used by the no-duplicates sampler
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        [Some(self.anchor.as_str()), Some(self.positive.as_str()), self.negative.as_deref()]
            .into_iter()
            .flatten()
    }
}

#[derive(Deserialize)]
struct RawDataset {
    corpus: TextMap,
    queries: TextMap,
    relevant_docs: RelevanceMap,
}

/// Query/corpus/relevance triple loaded from one JSON file
#[derive(Debug, Clone)]
pub struct RelevanceDataset {
    /// Corpus id -> passage text
    pub corpus: TextMap,
    /// Query id -> query text
    pub queries: TextMap,
    /// Query id -> relevant corpus ids
    pub relevant_docs: RelevanceMap,
    source: PathBuf,
}

impl RelevanceDataset {
    /// Build a dataset from in-memory maps
    pub fn new(corpus: TextMap, queries: TextMap, relevant_docs: RelevanceMap) -> Self {
        Self {
            corpus,
            queries,
            relevant_docs,
            source: PathBuf::from("<memory>"),
        }
    }

    /// Read and parse a dataset file
    ///
    /// Fails with [`DatasetError::Malformed`] when the JSON is invalid or one of
    /// `corpus`, `queries`, `relevant_docs` is missing or has the wrong shape.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut dataset = Self::from_json_str(&content)
            .map_err(|e| DatasetError::malformed(path, e.to_string()))?;
        dataset.source = path.to_path_buf();

        tracing::info!(
            "Loaded dataset {:?}: {} corpus entries, {} queries, {} relevance entries",
            path,
            dataset.corpus.len(),
            dataset.queries.len(),
            dataset.relevant_docs.len()
        );

        Ok(dataset)
    }

    /// Parse a dataset from a JSON string
    pub fn from_json_str(content: &str) -> serde_json::Result<Self> {
        let raw: RawDataset = serde_json::from_str(content)?;
        Ok(Self::new(raw.corpus, raw.queries, raw.relevant_docs))
    }

    /// File the dataset was read from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Check every relevance entry, not only the first id of each list
    ///
    /// The evaluator ranks against the whole relevance list, so a dangling id
    /// anywhere in it must be rejected up front.
    pub fn validate(&self) -> Result<(), DatasetError> {
        for (query_id, corpus_ids) in &self.relevant_docs {
            if !self.queries.contains_key(query_id) {
                return Err(DatasetError::dangling(
                    &self.source,
                    DatasetMap::Queries,
                    query_id,
                    query_id,
                ));
            }
            if corpus_ids.is_empty() {
                return Err(DatasetError::malformed(
                    &self.source,
                    format!("query '{}' has an empty relevance list", query_id),
                ));
            }
            if let Some(missing) = corpus_ids.iter().find(|id| !self.corpus.contains_key(*id)) {
                return Err(DatasetError::dangling(
                    &self.source,
                    DatasetMap::Corpus,
                    missing,
                    query_id,
                ));
            }
        }
        Ok(())
    }

    /// Reshape into anchor/positive records
    ///
    /// Emits exactly one record per relevance entry: the query text and the text
    /// of the *first* relevant corpus id. Further relevant ids are not turned
    /// into pairs; [`DatasetStats::ignored_relevant`] counts them.
    pub fn to_pairs(&self) -> Result<Vec<TrainingRecord>, DatasetError> {
        let mut records = Vec::with_capacity(self.relevant_docs.len());

        for (query_id, corpus_ids) in &self.relevant_docs {
            let anchor = self.queries.get(query_id).ok_or_else(|| {
                DatasetError::dangling(&self.source, DatasetMap::Queries, query_id, query_id)
            })?;

            let first_id = corpus_ids.first().ok_or_else(|| {
                DatasetError::malformed(
                    &self.source,
                    format!("query '{}' has an empty relevance list", query_id),
                )
            })?;

            let positive = self.corpus.get(first_id).ok_or_else(|| {
                DatasetError::dangling(&self.source, DatasetMap::Corpus, first_id, query_id)
            })?;

            records.push(TrainingRecord::new(anchor.clone(), positive.clone()));
        }

        Ok(records)
    }

    /// Summary counts
    pub fn stats(&self) -> DatasetStats {
        let total_relevant: usize = self.relevant_docs.values().map(Vec::len).sum();
        DatasetStats {
            corpus: self.corpus.len(),
            queries: self.queries.len(),
            relevance_entries: self.relevant_docs.len(),
            ignored_relevant: total_relevant.saturating_sub(self.relevant_docs.len()),
        }
    }

    /// Identifier for derived artifacts: the file name up to its first '.'
    pub fn run_id(file_name: &str) -> &str {
        file_name.split('.').next().unwrap_or(file_name)
    }
}

/// Dataset statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetStats {
    pub corpus: usize,
    pub queries: usize,
    pub relevance_entries: usize,
    /// Relevant ids beyond the first of each list (not used for pairs)
    pub ignored_relevant: usize,
}

impl std::fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} corpus, {} queries, {} pairs, {} extra relevant ids unused",
            self.corpus, self.queries, self.relevance_entries, self.ignored_relevant
        )
    }
}
