//! Hard-negative mining
//!
//! For every anchor, pick a text from the dataset's own positive pool that the
//! current model ranks close to the anchor but that is not one of the
//! anchor's positives. The mined dataset gains a `negative` column, and
//! anchors with no admissible candidate are dropped.
//!
//! Results are cached per run id so that repeated runs on the same data and
//! the same model weights skip the embedding pass.

use anyhow::{Context, Result};
use candle_core::Device;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Instant, UNIX_EPOCH};

use crate::data::TrainingRecord;
use crate::evaluation::ScoreFunction;
use crate::training::dataset::PairDataset;
use crate::training::hub::WEIGHTS_FILE;
use crate::training::models::{EmbeddingModel, SentenceEncoder};

/// How a negative is chosen among admissible candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    /// Highest-scoring admissible candidate
    #[default]
    Top,
    /// Uniformly random admissible candidate
    Random,
}

/// Miner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Candidates ranked above this position are skipped
    pub range_min: usize,
    /// Candidates ranked at or below this position are not considered
    pub range_max: Option<usize>,
    /// Admissible only if `score < positive_score - margin`
    pub margin: Option<f32>,
    pub sampling_strategy: SamplingStrategy,
    /// Texts embedded per forward pass
    pub batch_size: usize,
    pub seed: u64,
    /// Where `<run_id>.hnm.json` files live; `None` disables caching
    pub cache_dir: Option<PathBuf>,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            range_min: 0,
            range_max: None,
            margin: None,
            sampling_strategy: SamplingStrategy::Top,
            batch_size: 32,
            seed: 42,
            cache_dir: None,
        }
    }
}

/// On-disk cache entry
#[derive(Debug, Serialize, Deserialize)]
struct MiningCache {
    run_id: String,
    model: PathBuf,
    /// Size and mtime of the weights file the records were mined with
    #[serde(default)]
    weights: Option<String>,
    config: MiningConfig,
    input_records: usize,
    created_at: DateTime<Utc>,
    records: Vec<TrainingRecord>,
}

/// Mined records plus the count of anchors that got no negative
#[derive(Debug, Clone)]
pub struct MiningOutcome {
    pub records: Vec<TrainingRecord>,
    pub dropped: usize,
}

/// Mines one hard negative per anchor with the model at `model_dir`
pub struct HardNegativeMiner {
    model_dir: PathBuf,
    dataset: PairDataset,
    run_id: String,
    config: MiningConfig,
    device: Device,
}

impl HardNegativeMiner {
    pub fn new(model_dir: impl Into<PathBuf>, dataset: PairDataset, run_id: impl Into<String>) -> Self {
        Self {
            model_dir: model_dir.into(),
            dataset,
            run_id: run_id.into(),
            config: MiningConfig::default(),
            device: Device::Cpu,
        }
    }

    pub fn with_config(mut self, config: MiningConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        self.config
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.hnm.json", self.run_id)))
    }

    /// Return the dataset with a `negative` column, from cache when possible
    pub fn compute_retrieval(&self) -> Result<PairDataset> {
        if let Some(records) = self.load_cache()? {
            return Ok(PairDataset::new(records));
        }

        let model = SentenceEncoder::from_dir(&self.model_dir, &self.device)
            .with_context(|| format!("Failed to load mining model from {:?}", self.model_dir))?;
        let outcome = mine(&model, self.dataset.records(), &self.config)?;

        if outcome.dropped > 0 {
            tracing::warn!(
                "{}: {} of {} anchors had no admissible negative and were dropped",
                self.run_id,
                outcome.dropped,
                self.dataset.len()
            );
        }

        self.store_cache(&outcome.records)?;
        Ok(PairDataset::new(outcome.records))
    }

    fn load_cache(&self) -> Result<Option<Vec<TrainingRecord>>> {
        let Some(path) = self.cache_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read mining cache {:?}", path))?;
        let cache: MiningCache = match serde_json::from_str(&content) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!("Ignoring unreadable mining cache {:?}: {}", path, e);
                return Ok(None);
            }
        };

        let weights = weights_fingerprint(&self.model_dir);
        if cache.model != self.model_dir
            || weights.is_none()
            || cache.weights != weights
            || cache.config != self.config
            || cache.input_records != self.dataset.len()
            || !is_mined_subsequence(&cache.records, self.dataset.records())
        {
            tracing::info!("Mining cache {:?} is stale, mining again", path);
            return Ok(None);
        }

        tracing::info!(
            "Reusing {} mined records from {:?} (created {})",
            cache.records.len(),
            path,
            cache.created_at.to_rfc3339()
        );
        Ok(Some(cache.records))
    }

    fn store_cache(&self, records: &[TrainingRecord]) -> Result<()> {
        let Some(path) = self.cache_path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let cache = MiningCache {
            run_id: self.run_id.clone(),
            model: self.model_dir.clone(),
            weights: weights_fingerprint(&self.model_dir),
            config: self.config.clone(),
            input_records: self.dataset.len(),
            created_at: Utc::now(),
            records: records.to_vec(),
        };
        std::fs::write(&path, serde_json::to_string(&cache)?)
            .with_context(|| format!("Failed to write mining cache {:?}", path))?;
        tracing::debug!("Wrote mining cache {:?}", path);
        Ok(())
    }
}

/// `<len>-<mtime ns>` of the model weights, `None` when they cannot be read
fn weights_fingerprint(model_dir: &Path) -> Option<String> {
    let meta = std::fs::metadata(model_dir.join(WEIGHTS_FILE)).ok()?;
    let modified = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    Some(format!("{}-{}", meta.len(), modified.as_nanos()))
}

/// Cached records must be the input records, in order, each with a negative
fn is_mined_subsequence(cached: &[TrainingRecord], input: &[TrainingRecord]) -> bool {
    let mut input = input.iter();
    cached.iter().all(|c| {
        c.negative.is_some()
            && input
                .by_ref()
                .any(|r| r.anchor == c.anchor && r.positive == c.positive)
    })
}

/// Mine one negative per record
///
/// The candidate pool is the distinct positives in first-seen order. A
/// candidate is never a positive of the same anchor text, so a mined negative
/// never equals the record's positive.
pub fn mine(
    model: &dyn EmbeddingModel,
    records: &[TrainingRecord],
    config: &MiningConfig,
) -> Result<MiningOutcome> {
    let start = Instant::now();

    let mut seen = HashSet::new();
    let candidates: Vec<String> = records
        .iter()
        .filter(|r| seen.insert(r.positive.as_str()))
        .map(|r| r.positive.clone())
        .collect();
    let candidate_index: HashMap<&str, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();

    let mut positives_of: HashMap<&str, HashSet<&str>> = HashMap::new();
    for record in records {
        positives_of
            .entry(record.anchor.as_str())
            .or_default()
            .insert(record.positive.as_str());
    }

    tracing::info!(
        "Mining hard negatives for {} anchors against {} candidates",
        records.len(),
        candidates.len()
    );

    let anchors: Vec<String> = records.iter().map(|r| r.anchor.clone()).collect();
    let anchor_embeddings = model.encode(&anchors, config.batch_size)?;
    let candidate_embeddings = model.encode(&candidates, config.batch_size)?;
    let scores = if records.is_empty() {
        Vec::new()
    } else {
        ScoreFunction::Cosine
            .scores(&anchor_embeddings, &candidate_embeddings)?
            .to_vec2::<f32>()?
    };

    let mut rng = StdRng::seed_from_u64(config.seed);
    let range_max = config.range_max.unwrap_or(candidates.len()).min(candidates.len());
    let mut mined = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for (record, row) in records.iter().zip(&scores) {
        let positive_score = row[candidate_index[record.positive.as_str()]];
        let own_positives = &positives_of[record.anchor.as_str()];

        let mut ranked: Vec<usize> = (0..candidates.len()).collect();
        ranked.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));

        let admissible: Vec<usize> = ranked
            .iter()
            .copied()
            .take(range_max)
            .skip(config.range_min)
            .filter(|&i| !own_positives.contains(candidates[i].as_str()))
            .filter(|&i| match config.margin {
                Some(margin) => row[i] < positive_score - margin,
                None => true,
            })
            .collect();

        let choice = match config.sampling_strategy {
            SamplingStrategy::Top => admissible.first().copied(),
            SamplingStrategy::Random => admissible.choose(&mut rng).copied(),
        };

        match choice {
            Some(i) => mined.push(record.clone().with_negative(candidates[i].clone())),
            None => dropped += 1,
        }
    }

    tracing::info!(
        "Mined {} negatives in {:.2}s ({} anchors dropped)",
        mined.len(),
        start.elapsed().as_secs_f64(),
        dropped
    );

    Ok(MiningOutcome {
        records: mined,
        dropped,
    })
}

/// `<project>/data/.hnm_cache`
pub fn default_cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(".hnm_cache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::ir::tests::LetterModel;
    use crate::training::models::tests::write_tiny_model;

    fn letter_model() -> LetterModel {
        LetterModel { device: Device::Cpu }
    }

    fn records() -> Vec<TrainingRecord> {
        vec![
            TrainingRecord::new("aab", "aaa"),
            TrainingRecord::new("bbc", "bbb"),
            TrainingRecord::new("ccc", "ccc"),
            TrainingRecord::new("abx", "xxx"),
        ]
    }

    #[test]
    fn test_top_strategy_picks_closest_non_positive() {
        let outcome = mine(&letter_model(), &records(), &MiningConfig::default()).unwrap();
        assert_eq!(outcome.dropped, 0);

        // "aab" is closest to "aaa" (its positive), then "bbb"
        assert_eq!(outcome.records[0].negative.as_deref(), Some("bbb"));
        // "bbc" -> positive "bbb", then "ccc"
        assert_eq!(outcome.records[1].negative.as_deref(), Some("ccc"));
        for record in &outcome.records {
            assert_ne!(record.negative.as_deref(), Some(record.positive.as_str()));
        }
    }

    #[test]
    fn test_shared_anchor_positives_are_excluded() {
        let records = vec![
            TrainingRecord::new("aaa", "aab"),
            TrainingRecord::new("aaa", "aac"),
            TrainingRecord::new("zzz", "bbb"),
        ];
        let outcome = mine(&letter_model(), &records, &MiningConfig::default()).unwrap();
        assert_eq!(outcome.records[0].negative.as_deref(), Some("bbb"));
        assert_eq!(outcome.records[1].negative.as_deref(), Some("bbb"));
    }

    #[test]
    fn test_anchor_without_candidates_is_dropped() {
        let records = vec![TrainingRecord::new("aaa", "aaa")];
        let outcome = mine(&letter_model(), &records, &MiningConfig::default()).unwrap();
        assert_eq!(outcome.dropped, 1);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn test_range_and_margin_filters() {
        let config = MiningConfig {
            range_min: 1,
            range_max: Some(2),
            ..Default::default()
        };
        // ranks for "aab": aaa(0), bbb(1), ...
        let outcome = mine(&letter_model(), &records()[..1], &config).unwrap();
        assert_eq!(outcome.dropped, 1, "only its own positive in range");

        let outcome = mine(&letter_model(), &records(), &config).unwrap();
        assert_eq!(outcome.records[0].negative.as_deref(), Some("bbb"));

        let strict = MiningConfig {
            margin: Some(2.0),
            ..Default::default()
        };
        let outcome = mine(&letter_model(), &records(), &strict).unwrap();
        assert_eq!(outcome.dropped, 4);
    }

    #[test]
    fn test_random_strategy_is_seeded() {
        let config = MiningConfig {
            sampling_strategy: SamplingStrategy::Random,
            seed: 7,
            ..Default::default()
        };
        let a = mine(&letter_model(), &records(), &config).unwrap();
        let b = mine(&letter_model(), &records(), &config).unwrap();
        assert_eq!(a.records, b.records);
        for record in &a.records {
            assert_ne!(record.negative.as_deref(), Some(record.positive.as_str()));
        }
    }

    #[test]
    fn test_compute_retrieval_with_cache() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = write_tiny_model(&dir.path().join("model"));
        let cache_dir = dir.path().join(".hnm_cache");
        let dataset = PairDataset::new(vec![
            TrainingRecord::new("what is rust", "rust is a language"),
            TrainingRecord::new("what is python", "python is a snake"),
            TrainingRecord::new("how does cargo work", "cargo is a package manager"),
        ]);
        let config = MiningConfig {
            cache_dir: Some(cache_dir.clone()),
            ..Default::default()
        };

        let miner = HardNegativeMiner::new(&model_dir, dataset.clone(), "train").with_config(config.clone());
        let mined = miner.compute_retrieval().unwrap();
        assert_eq!(mined.len(), 3);
        assert!(mined.has_negatives());
        assert!(cache_dir.join("train.hnm.json").exists());

        // cache hit without loading the model: a broken tokenizer goes unnoticed
        std::fs::write(model_dir.join("tokenizer.json"), "not a tokenizer").unwrap();
        let again = HardNegativeMiner::new(&model_dir, dataset.clone(), "train")
            .with_config(config.clone())
            .compute_retrieval()
            .unwrap();
        assert_eq!(again.records(), mined.records());

        // different input invalidates the cache and needs the model again
        let other = PairDataset::new(vec![TrainingRecord::new("a", "b"), TrainingRecord::new("c", "d")]);
        assert!(HardNegativeMiner::new(&model_dir, other, "train")
            .with_config(config)
            .compute_retrieval()
            .is_err());
    }

    fn cached_model(cache_file: &Path) -> PathBuf {
        let cache: MiningCache =
            serde_json::from_str(&std::fs::read_to_string(cache_file).unwrap()).unwrap();
        cache.model
    }

    #[test]
    fn test_cache_is_keyed_on_model() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_tiny_model(&dir.path().join("first"));
        let second = write_tiny_model(&dir.path().join("second"));
        let cache_dir = dir.path().join(".hnm_cache");
        let cache_file = cache_dir.join("train.hnm.json");
        let dataset = PairDataset::new(vec![
            TrainingRecord::new("what is rust", "rust is a language"),
            TrainingRecord::new("what is python", "python is a snake"),
        ]);
        let config = MiningConfig {
            cache_dir: Some(cache_dir.clone()),
            ..Default::default()
        };
        let miner = |model_dir: &Path| {
            HardNegativeMiner::new(model_dir, dataset.clone(), "train").with_config(config.clone())
        };

        miner(&first).compute_retrieval().unwrap();
        assert_eq!(cached_model(&cache_file), first);

        // another model with the same run id mines again
        miner(&second).compute_retrieval().unwrap();
        assert_eq!(cached_model(&cache_file), second);

        // new weights in the same directory also miss, so the broken model is loaded
        let weights = second.join(WEIGHTS_FILE);
        std::fs::File::options()
            .write(true)
            .open(&weights)
            .unwrap()
            .set_modified(UNIX_EPOCH + std::time::Duration::from_secs(1_000_000))
            .unwrap();
        std::fs::write(second.join("tokenizer.json"), "not a tokenizer").unwrap();
        assert!(miner(&second).compute_retrieval().is_err());
    }

    #[test]
    fn test_subsequence_check() {
        let input = records();
        let cached = vec![input[1].clone().with_negative("x"), input[3].clone().with_negative("y")];
        assert!(is_mined_subsequence(&cached, &input));

        let reordered = vec![input[3].clone().with_negative("y"), input[1].clone().with_negative("x")];
        assert!(!is_mined_subsequence(&reordered, &input));

        let unmined = vec![input[0].clone()];
        assert!(!is_mined_subsequence(&unmined, &input));
    }
}
