//! Pair datasets and batch samplers for training
//!
//! Holds anchor/positive(/negative) records and turns them into batches of
//! record indices, reshuffled every epoch.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::data::TrainingRecord;

/// Training dataset of contrastive records
#[derive(Debug, Clone, Default)]
pub struct PairDataset {
    records: Vec<TrainingRecord>,
}

impl PairDataset {
    /// Create a new dataset from records
    pub fn new(records: Vec<TrainingRecord>) -> Self {
        Self { records }
    }

    /// Get the number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get a record by index
    pub fn get(&self, index: usize) -> Option<&TrainingRecord> {
        self.records.get(index)
    }

    /// Iterate over records
    pub fn iter(&self) -> impl Iterator<Item = &TrainingRecord> {
        self.records.iter()
    }

    /// All records
    pub fn records(&self) -> &[TrainingRecord] {
        &self.records
    }

    /// Whether every record carries a negative
    pub fn has_negatives(&self) -> bool {
        !self.records.is_empty() && self.records.iter().all(|r| r.negative.is_some())
    }

    /// Column names in the order the loss consumes them
    pub fn columns(&self) -> Vec<&'static str> {
        if self.has_negatives() {
            vec!["anchor", "positive", "negative"]
        } else {
            vec!["anchor", "positive"]
        }
    }

    /// Gather a batch of records into column vectors
    pub fn collate(&self, indices: &[usize]) -> Batch {
        let mut batch = Batch::default();
        let with_negatives = self.has_negatives();

        for record in indices.iter().filter_map(|&i| self.records.get(i)) {
            batch.anchors.push(record.anchor.clone());
            batch.positives.push(record.positive.clone());
            if with_negatives {
                if let Some(negative) = &record.negative {
                    batch.negatives.push(negative.clone());
                }
            }
        }

        batch
    }
}

impl From<Vec<TrainingRecord>> for PairDataset {
    fn from(records: Vec<TrainingRecord>) -> Self {
        Self::new(records)
    }
}

/// Column-major batch of texts
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub anchors: Vec<String>,
    pub positives: Vec<String>,
    /// Empty unless the dataset was mined
    pub negatives: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn has_negatives(&self) -> bool {
        !self.negatives.is_empty()
    }
}

/// Batch sampling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSamplerKind {
    /// Plain shuffled batches
    BatchSampler,
    /// Shuffled batches that never repeat a text inside one batch
    #[default]
    NoDuplicates,
}

impl std::str::FromStr for BatchSamplerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "batch_sampler" | "default" => Ok(Self::BatchSampler),
            "no_duplicates" => Ok(Self::NoDuplicates),
            _ => Err(anyhow::anyhow!(
                "Invalid batch sampler: {}. Valid options: batch_sampler, no_duplicates",
                s
            )),
        }
    }
}

/// Produce the batches of one epoch
///
/// Both samplers shuffle with `StdRng::seed_from_u64(seed)`; callers pass
/// `seed + epoch` so each epoch sees a different, reproducible order.
pub fn sample_batches(
    dataset: &PairDataset,
    batch_size: usize,
    kind: BatchSamplerKind,
    seed: u64,
) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    let mut indices: Vec<usize> = (0..dataset.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    match kind {
        BatchSamplerKind::BatchSampler => indices.chunks(batch_size).map(<[usize]>::to_vec).collect(),
        BatchSamplerKind::NoDuplicates => no_duplicate_batches(dataset, indices, batch_size),
    }
}

/// Greedy no-duplicates batching
///
/// Walks the remaining indices in shuffled order and adds a record to the
/// current batch only if none of its texts is already in the batch. Skipped
/// records stay in the pool for later batches, so every index is yielded
/// exactly once; the last batches may be smaller than `batch_size`.
fn no_duplicate_batches(
    dataset: &PairDataset,
    mut remaining: Vec<usize>,
    batch_size: usize,
) -> Vec<Vec<usize>> {
    let mut batches = Vec::with_capacity(remaining.len() / batch_size + 1);

    while !remaining.is_empty() {
        let mut batch_texts: HashSet<&str> = HashSet::new();
        let mut batch: Vec<usize> = Vec::with_capacity(batch_size);

        for &index in &remaining {
            let Some(record) = dataset.get(index) else {
                continue;
            };
            let texts: Vec<&str> = record.texts().collect();
            if texts.iter().any(|t| batch_texts.contains(t)) {
                continue;
            }

            batch.push(index);
            if batch.len() == batch_size {
                break;
            }
            batch_texts.extend(texts);
        }

        let taken: HashSet<usize> = batch.iter().copied().collect();
        remaining.retain(|i| !taken.contains(i));
        batches.push(batch);
    }

    batches
}

/// Number of batches per epoch used for step planning
pub fn planned_batches(dataset_len: usize, batch_size: usize) -> usize {
    let batch_size = batch_size.max(1);
    (dataset_len + batch_size - 1) / batch_size
}
