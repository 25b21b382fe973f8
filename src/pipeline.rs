//! End-to-end fine-tuning run
//!
//! validate inputs → load datasets → (mine hard negatives) → load model →
//! configure trainer → fit → save → report elapsed time.

use anyhow::{Context, Result};
use candle_core::Device;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::data::RelevanceDataset;
use crate::error::ConfigError;
use crate::evaluation::{InformationRetrievalEvaluator, IrEvaluatorConfig};
use crate::mining::{default_cache_dir, HardNegativeMiner, MiningConfig};
use crate::training::{
    resolve_model, select_device, DevicePreference, ModelPath, MultipleNegativesRankingLoss,
    PairDataset, SentenceEncoder, TrainOutput, Trainer, TrainingArguments,
};

/// Directory layout of a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub project_dir: PathBuf,
    /// Input model, `model/<name>`
    pub model_dir: PathBuf,
    /// Fine-tuned model, `model/ft_<name>`
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl RunPaths {
    pub fn new(project_dir: impl Into<PathBuf>, model_name: &str) -> Self {
        let project_dir = project_dir.into();
        let models = project_dir.join("model");
        let data_dir = project_dir.join("data");
        Self {
            model_dir: models.join(model_name),
            // hub ids contain '/', keep the output a single directory
            output_dir: models.join(format!("ft_{}", model_name.replace('/', "_"))),
            cache_dir: default_cache_dir(&data_dir),
            data_dir,
            project_dir,
        }
    }

    pub fn dataset(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }
}

/// Options of one fine-tuning run
#[derive(Debug, Clone)]
pub struct FinetuneOptions {
    pub model: String,
    pub train_file: String,
    pub val_file: String,
    pub hnm: bool,
    pub project_dir: PathBuf,
    pub device: DevicePreference,
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub learning_rate: Option<f64>,
    pub seed: Option<u64>,
}

impl FinetuneOptions {
    pub fn new(model: impl Into<String>, train_file: impl Into<String>, val_file: impl Into<String>, hnm: bool) -> Self {
        Self {
            model: model.into(),
            train_file: train_file.into(),
            val_file: val_file.into(),
            hnm,
            project_dir: PathBuf::from("."),
            device: DevicePreference::Auto,
            epochs: None,
            batch_size: None,
            learning_rate: None,
            seed: None,
        }
    }

    /// Trainer arguments for this run; selection metric is the cosine nDCG@10
    /// of the evaluator named after the model
    pub fn training_arguments(&self, paths: &RunPaths) -> TrainingArguments {
        let defaults = TrainingArguments::new(&paths.output_dir);
        TrainingArguments {
            num_train_epochs: self.epochs.unwrap_or(defaults.num_train_epochs),
            per_device_train_batch_size: self.batch_size.unwrap_or(defaults.per_device_train_batch_size),
            learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
            seed: self.seed.unwrap_or(defaults.seed),
            metric_for_best_model: Some(IrEvaluatorConfig::named(&self.model).primary_metric()),
            ..defaults
        }
    }
}

fn require_dataset(path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingDataset(path.to_path_buf()))
    }
}

fn load_dataset(path: &Path) -> Result<(RelevanceDataset, PairDataset)> {
    let dataset = RelevanceDataset::from_file(path)?;
    dataset.validate()?;
    let stats = dataset.stats();
    tracing::debug!("{:?}: {}", path, stats);
    if stats.ignored_relevant > 0 {
        tracing::warn!(
            "{:?}: {} relevant ids beyond the first per query are not used for training pairs",
            path,
            stats.ignored_relevant
        );
    }
    let pairs = PairDataset::new(dataset.to_pairs()?);
    Ok((dataset, pairs))
}

fn mine(
    model_path: &ModelPath,
    dataset: PairDataset,
    file_name: &str,
    config: &MiningConfig,
    device: &Device,
) -> Result<PairDataset> {
    let run_id = RelevanceDataset::run_id(file_name);
    HardNegativeMiner::new(&model_path.path, dataset, run_id)
        .with_config(config.clone())
        .with_device(device.clone())
        .compute_retrieval()
        .with_context(|| format!("Hard negative mining failed for {}", file_name))
}

/// Run the whole fine-tuning pipeline
pub fn run(options: &FinetuneOptions) -> Result<TrainOutput> {
    let start = Instant::now();
    let paths = RunPaths::new(&options.project_dir, &options.model);
    tracing::info!(
        "Fine-tuning {} (train: {}, val: {}, hnm: {})",
        options.model,
        options.train_file,
        options.val_file,
        options.hnm
    );

    let train_path = paths.dataset(&options.train_file);
    let val_path = paths.dataset(&options.val_file);
    require_dataset(&val_path)?;
    require_dataset(&train_path)?;
    let args = options.training_arguments(&paths);
    args.validate()?;

    let (val_data, val_pairs) = load_dataset(&val_path)?;
    let (_, mut train_pairs) = load_dataset(&train_path)?;
    let model_path = resolve_model(&paths.model_dir, &options.model)?;
    tracing::debug!(
        "First positives: {:?}",
        train_pairs.iter().take(2).map(|r| r.positive.as_str()).collect::<Vec<_>>()
    );

    let device = select_device(options.device)?;

    if options.hnm {
        tracing::info!("Start mining hard negative samples");
        let mining = MiningConfig {
            cache_dir: Some(paths.cache_dir.clone()),
            seed: args.seed,
            ..Default::default()
        };
        train_pairs = mine(&model_path, train_pairs, &options.train_file, &mining, &device)?;
        tracing::debug!(
            "First negatives: {:?}",
            train_pairs
                .iter()
                .take(2)
                .filter_map(|r| r.negative.as_deref())
                .collect::<Vec<_>>()
        );
        // mined for parity with the train set; the evaluator ranks the raw maps
        let val_mined = mine(&model_path, val_pairs, &options.val_file, &mining, &device)?;
        tracing::debug!("Mined {} validation records", val_mined.len());
    }
    tracing::info!("Training columns: {:?}", train_pairs.columns());
    tracing::info!("Dataset processed.");

    let model = SentenceEncoder::load(&model_path, &device)?;
    tracing::info!("Model Loaded");

    let evaluator = InformationRetrievalEvaluator::new(
        &val_data.queries,
        &val_data.corpus,
        &val_data.relevant_docs,
        IrEvaluatorConfig {
            batch_size: args.per_device_eval_batch_size,
            ..IrEvaluatorConfig::named(&options.model)
        },
    );

    let mut trainer = Trainer::new(
        model,
        args,
        train_pairs,
        MultipleNegativesRankingLoss::default(),
        Some(evaluator),
    )?;
    let output = trainer.train()?;
    trainer.save_model()?;
    tracing::info!("Model Trained.");
    tracing::info!("cost time: {:.2}s", start.elapsed().as_secs_f64());

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatasetError;
    use crate::training::models::tests::write_tiny_model;
    use crate::training::hub::WEIGHTS_FILE;

    fn write_dataset(path: &Path, offset: usize) {
        let queries = [
            "what is rust",
            "what is python",
            "how does cargo work",
            "why use the borrow checker",
        ];
        let docs = [
            "rust is a safe language",
            "python is a snake",
            "cargo is a package manager",
            "the borrow checker is memory safe",
        ];
        let mut corpus = serde_json::Map::new();
        let mut qs = serde_json::Map::new();
        let mut rel = serde_json::Map::new();
        for i in 0..queries.len() {
            let q = format!("q{}", i + offset);
            let c = format!("c{}", i + offset);
            corpus.insert(c.clone(), docs[i].into());
            qs.insert(q.clone(), queries[i].into());
            rel.insert(q, serde_json::json!([c]));
        }
        let json = serde_json::json!({"corpus": corpus, "queries": qs, "relevant_docs": rel});
        std::fs::write(path, json.to_string()).unwrap();
    }

    fn project(name: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_model(&dir.path().join("model").join(name));
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        write_dataset(&dir.path().join("data/train.json"), 0);
        write_dataset(&dir.path().join("data/val.json"), 100);
        dir
    }

    fn options(dir: &Path, hnm: bool) -> FinetuneOptions {
        FinetuneOptions {
            project_dir: dir.to_path_buf(),
            device: DevicePreference::Cpu,
            epochs: Some(2),
            learning_rate: Some(1e-3),
            ..FinetuneOptions::new("tiny", "train.json", "val.json", hnm)
        }
    }

    #[test]
    fn test_run_paths_layout() {
        let paths = RunPaths::new("/proj", "bge-small");
        assert_eq!(paths.model_dir, PathBuf::from("/proj/model/bge-small"));
        assert_eq!(paths.output_dir, PathBuf::from("/proj/model/ft_bge-small"));
        assert_eq!(paths.dataset("train.json"), PathBuf::from("/proj/data/train.json"));
        assert!(paths.cache_dir.starts_with("/proj/data"));

        let hub = RunPaths::new("/proj", "BAAI/bge-small-en");
        assert_eq!(hub.output_dir, PathBuf::from("/proj/model/ft_BAAI_bge-small-en"));
    }

    #[test]
    fn test_training_arguments_overrides() {
        let paths = RunPaths::new("/proj", "tiny");
        let opts = FinetuneOptions {
            batch_size: Some(8),
            ..FinetuneOptions::new("tiny", "t.json", "v.json", false)
        };
        let args = opts.training_arguments(&paths);
        assert_eq!(args.per_device_train_batch_size, 8);
        assert_eq!(args.num_train_epochs, 5);
        assert_eq!(args.best_metric_key(), "eval_tiny_cosine_ndcg@10");
        assert!(args.higher_is_better());
        assert_eq!(args.output_dir, paths.output_dir);
    }

    #[test]
    fn test_missing_dataset_is_config_error() {
        let dir = project("tiny");
        let opts = FinetuneOptions {
            train_file: "absent.json".to_string(),
            ..options(dir.path(), false)
        };
        let err = run(&opts).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingDataset(_))
        ));
    }

    #[test]
    fn test_malformed_dataset_fails_before_model_lookup() {
        let dir = project("tiny");
        std::fs::write(dir.path().join("data/train.json"), "{\"corpus\": [").unwrap();
        // a Hub id with no local directory would otherwise trigger a download
        let opts = FinetuneOptions {
            model: "embedtune-test/absent-model".to_string(),
            ..options(dir.path(), false)
        };
        let err = run(&opts).unwrap_err();
        assert!(
            matches!(err.downcast_ref::<DatasetError>(), Some(DatasetError::Malformed { .. })),
            "{err:#}"
        );
    }

    #[test]
    fn test_run_end_to_end() {
        let dir = project("tiny");
        let output = run(&options(dir.path(), false)).unwrap();
        assert!(output.global_step > 0);

        let out = dir.path().join("model/ft_tiny");
        assert!(out.join(WEIGHTS_FILE).exists());
        assert!(out.join("training_args.json").exists());
    }

    #[test]
    fn test_run_with_hard_negatives_writes_cache() {
        let dir = project("tiny");
        run(&options(dir.path(), true)).unwrap();

        let cache = RunPaths::new(dir.path(), "tiny").cache_dir;
        assert!(cache.join("train.hnm.json").exists());
        assert!(cache.join("val.hnm.json").exists());
    }
}
