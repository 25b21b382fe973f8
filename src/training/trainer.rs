//! Training loop for fine-tuning sentence encoders
//!
//! Provides:
//! - Gradient accumulation with gradient-norm clipping
//! - Learning rate scheduling with warmup
//! - Evaluation and checkpointing per epoch or per N steps
//! - Best-checkpoint selection and reload at the end of training

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::args::{IntervalStrategy, TrainingArguments};
use super::checkpoint::{CheckpointManager, TrainerState};
use super::dataset::{planned_batches, sample_batches, PairDataset};
use super::device::{device_label, enable_tf32};
use super::hub::WEIGHTS_FILE;
use super::loss::MultipleNegativesRankingLoss;
use super::models::{EmbeddingModel, SentenceEncoder};
use super::optimizer::{clip_grad_norm, AdamW, GradientAccumulator, LearningRateScheduler};
use crate::evaluation::InformationRetrievalEvaluator;

pub const TRAINING_ARGS_FILE: &str = "training_args.json";

/// Metrics reported every `logging_steps` optimizer steps
#[derive(Debug, Clone, Default)]
pub struct StepMetrics {
    pub global_step: usize,
    pub epoch: f64,
    /// Mean micro-batch loss since the previous report
    pub loss: f64,
    /// Gradient norm before clipping at the last step
    pub grad_norm: f64,
    pub learning_rate: f64,
    pub samples_per_second: f64,
}

impl std::fmt::Display for StepMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Step {} | Epoch {:.2} | Loss: {:.4} | Grad norm: {:.4} | LR: {:.2e} | {:.1} samples/s",
            self.global_step,
            self.epoch,
            self.loss,
            self.grad_norm,
            self.learning_rate,
            self.samples_per_second
        )
    }
}

impl StepMetrics {
    fn to_log_values(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("loss".to_string(), self.loss),
            ("grad_norm".to_string(), self.grad_norm),
            ("learning_rate".to_string(), self.learning_rate),
        ])
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean loss over every micro-batch of the run
    pub training_loss: f64,
    pub runtime_secs: f64,
    pub best_checkpoint: Option<PathBuf>,
    pub best_metric: Option<f64>,
}

/// Trainer for a sentence encoder
pub struct Trainer {
    model: SentenceEncoder,
    args: TrainingArguments,
    train_dataset: PairDataset,
    loss: MultipleNegativesRankingLoss,
    evaluator: Option<InformationRetrievalEvaluator>,
    state: TrainerState,
}

impl Trainer {
    pub fn new(
        mut model: SentenceEncoder,
        args: TrainingArguments,
        train_dataset: PairDataset,
        loss: MultipleNegativesRankingLoss,
        evaluator: Option<InformationRetrievalEvaluator>,
    ) -> Result<Self> {
        args.validate()?;
        if train_dataset.is_empty() {
            bail!("Training dataset is empty");
        }
        if let Some(max_seq_length) = args.max_seq_length {
            model.set_max_seq_length(max_seq_length)?;
        }

        let state = TrainerState {
            num_train_epochs: args.num_train_epochs,
            device: device_label(model.device()).to_string(),
            ..Default::default()
        };

        Ok(Self {
            model,
            args,
            train_dataset,
            loss,
            evaluator,
            state,
        })
    }

    pub fn model(&self) -> &SentenceEncoder {
        &self.model
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    fn configure_precision(&self) -> Result<()> {
        if self.args.tf32 {
            if enable_tf32(self.model.device()) {
                tracing::info!("TF32 matmuls enabled");
            } else {
                tracing::warn!(
                    "tf32 requested but not supported on {}, ignored",
                    device_label(self.model.device())
                );
            }
        }
        if self.args.bf16 {
            tracing::warn!("bf16 requested; mixed precision is not available, training in f32");
        }
        self.model.set_seed(self.args.seed)
    }

    /// Run the fit loop
    pub fn train(&mut self) -> Result<TrainOutput> {
        let start = Instant::now();
        let args = self.args.clone();
        let batch_size = args.per_device_train_batch_size;
        let accumulation = args.gradient_accumulation_steps;

        let steps_per_epoch = args.steps_per_epoch(planned_batches(self.train_dataset.len(), batch_size));
        let max_steps = steps_per_epoch * args.num_train_epochs;
        let warmup_steps = LearningRateScheduler::warmup_from_ratio(max_steps, args.warmup_ratio);

        tracing::info!("Starting training:");
        tracing::info!("  Num examples: {}", self.train_dataset.len());
        tracing::info!("  Columns: {:?}", self.train_dataset.columns());
        tracing::info!("  Epochs: {}", args.num_train_epochs);
        tracing::info!("  Batch size: {}", batch_size);
        tracing::info!("  Gradient accumulation steps: {}", accumulation);
        tracing::info!("  Effective batch size: {}", batch_size * accumulation);
        tracing::info!("  Total optimization steps: {}", max_steps);
        tracing::info!("  Warmup steps: {}", warmup_steps);
        tracing::info!("  Learning rate: {} ({:?})", args.learning_rate, args.lr_scheduler_type);
        tracing::info!("  Trainable parameters: {}", self.model.num_parameters());
        tracing::debug!("Training arguments: {:?}", args);

        self.configure_precision()?;

        let vars = self.model.vars();
        let mut optimizer = AdamW::new(vars.clone(), args.adamw())?;
        let mut scheduler = LearningRateScheduler::new(
            args.lr_scheduler_type,
            args.learning_rate,
            warmup_steps,
            max_steps,
        );
        optimizer.set_learning_rate(scheduler.get_lr());

        let mut accumulator = GradientAccumulator::new(vars.clone());
        let mut checkpoints = CheckpointManager::new(
            &args.output_dir,
            args.save_total_limit,
            args.best_metric_key(),
            args.higher_is_better(),
        );
        std::fs::create_dir_all(&args.output_dir)
            .with_context(|| format!("Failed to create output directory {:?}", args.output_dir))?;

        self.state.max_steps = max_steps;
        let mut report = StepMetrics::default();
        let mut report_loss = 0.0;
        let mut report_batches = 0usize;
        let mut report_samples = 0usize;
        let mut report_start = Instant::now();
        let mut total_loss = 0.0;
        let mut total_batches = 0usize;

        for epoch in 0..args.num_train_epochs {
            let epoch_start = Instant::now();
            let batches = sample_batches(
                &self.train_dataset,
                batch_size,
                args.batch_sampler,
                args.seed + epoch as u64,
            );
            let num_batches = batches.len();
            let mut epoch_loss = 0.0;

            for (batch_idx, indices) in batches.iter().enumerate() {
                let batch = self.train_dataset.collate(indices);
                let loss = self.loss.forward_batch(&self.model, &batch)?;
                let loss_value = loss.to_scalar::<f32>()? as f64;

                let scaled = (loss / accumulation as f64)?;
                accumulator.add(scaled.backward()?)?;

                report_loss += loss_value;
                report_batches += 1;
                report_samples += batch.len();
                epoch_loss += loss_value;
                total_loss += loss_value;
                total_batches += 1;

                let last_in_epoch = batch_idx + 1 == num_batches;
                if accumulator.pending() < accumulation && !last_in_epoch {
                    continue;
                }

                let mut grads = accumulator
                    .take()
                    .ok_or_else(|| anyhow!("No gradients accumulated"))?;
                let grad_norm = clip_grad_norm(&mut grads, &vars, args.max_grad_norm)?;
                let step_lr = optimizer.learning_rate();
                optimizer.step(&grads)?;
                optimizer.set_learning_rate(scheduler.step());

                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + (batch_idx + 1) as f64 / num_batches as f64;
                let step = self.state.global_step;

                if args.logging_steps > 0 && step % args.logging_steps == 0 {
                    let elapsed = report_start.elapsed().as_secs_f64();
                    report = StepMetrics {
                        global_step: step,
                        epoch: self.state.epoch,
                        loss: report_loss / report_batches.max(1) as f64,
                        grad_norm,
                        learning_rate: step_lr,
                        samples_per_second: report_samples as f64 / elapsed.max(1e-9),
                    };
                    tracing::info!("{}", report);
                    self.state.log(report.to_log_values());
                    report_loss = 0.0;
                    report_batches = 0;
                    report_samples = 0;
                    report_start = Instant::now();
                }

                let mut metrics = None;
                if args.eval_strategy == IntervalStrategy::Steps
                    && args.eval_steps.is_some_and(|n| step % n == 0)
                {
                    metrics = Some(self.evaluate()?);
                }
                if args.save_strategy == IntervalStrategy::Steps
                    && args.save_steps.is_some_and(|n| step % n == 0)
                {
                    checkpoints.save(&self.model, &mut self.state, metrics.as_ref())?;
                }
            }

            tracing::info!(
                "Epoch {} completed in {:.1}s | Avg loss: {:.4} | Batches: {}",
                epoch + 1,
                epoch_start.elapsed().as_secs_f64(),
                epoch_loss / num_batches.max(1) as f64,
                num_batches
            );

            let mut metrics = None;
            if args.eval_strategy == IntervalStrategy::Epoch {
                metrics = Some(self.evaluate()?);
            }
            if args.save_strategy == IntervalStrategy::Epoch {
                checkpoints.save(&self.model, &mut self.state, metrics.as_ref())?;
            }
        }

        if args.load_best_model_at_end {
            match checkpoints.best_checkpoint() {
                Some(best) => {
                    tracing::info!(
                        "Loading best model from {:?} ({} = {:.4})",
                        best,
                        checkpoints.metric_key(),
                        checkpoints.best_metric().unwrap_or_default()
                    );
                    self.model.load_weights(&best.join(WEIGHTS_FILE))?;
                }
                None => tracing::warn!(
                    "No checkpoint recorded {}; keeping the final weights",
                    checkpoints.metric_key()
                ),
            }
        }

        let runtime_secs = start.elapsed().as_secs_f64();
        let training_loss = total_loss / total_batches.max(1) as f64;
        tracing::info!(
            "Training finished: {} steps in {:.1}s | train_loss {:.4} | {:.1} samples/s",
            self.state.global_step,
            runtime_secs,
            training_loss,
            (self.train_dataset.len() * args.num_train_epochs) as f64 / runtime_secs.max(1e-9)
        );
        tracing::debug!("Last step report: {}", report);

        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            runtime_secs,
            best_checkpoint: checkpoints.best_checkpoint().map(Path::to_path_buf),
            best_metric: checkpoints.best_metric(),
        })
    }

    /// Run the evaluator; metrics are keyed `eval_{name}_{score_fn}_{metric}@{k}`
    pub fn evaluate(&mut self) -> Result<BTreeMap<String, f64>> {
        let Some(evaluator) = &self.evaluator else {
            return Ok(BTreeMap::new());
        };

        let result = evaluator.evaluate(&self.model as &dyn EmbeddingModel)?;
        let metrics = result.prefixed("eval_");
        if let Some(score) = result.primary_score() {
            tracing::info!(
                "Evaluation at step {} (epoch {:.2}): eval_{} = {:.4}",
                self.state.global_step,
                self.state.epoch,
                result.primary_metric,
                score
            );
        }
        self.state.log(metrics.clone());
        Ok(metrics)
    }

    /// Write the model to `output_dir` together with `training_args.json`
    pub fn save_model(&self) -> Result<PathBuf> {
        let dir = &self.args.output_dir;
        self.model.save(dir)?;
        let args_path = dir.join(TRAINING_ARGS_FILE);
        std::fs::write(&args_path, serde_json::to_string_pretty(&self.args)?)
            .with_context(|| format!("Failed to write {:?}", args_path))?;
        tracing::info!("Saved model to {:?}", dir);
        Ok(dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RelevanceMap, TextMap, TrainingRecord};
    use crate::evaluation::IrEvaluatorConfig;
    use crate::training::checkpoint::TRAINER_STATE_FILE;
    use crate::training::models::tests::{write_tiny_model, write_tiny_model_with_dropout};
    use candle_core::Device;

    fn pairs() -> Vec<TrainingRecord> {
        vec![
            TrainingRecord::new("what is rust", "rust is a safe language"),
            TrainingRecord::new("what is python", "python is a snake"),
            TrainingRecord::new("how does cargo work", "cargo is a package manager"),
            TrainingRecord::new("why use the borrow checker", "the borrow checker is memory safe"),
            TrainingRecord::new("what is a ship", "a boat on the sea"),
        ]
    }

    fn evaluator() -> InformationRetrievalEvaluator {
        let mut corpus = TextMap::new();
        let mut queries = TextMap::new();
        let mut relevant = RelevanceMap::new();
        for (i, record) in pairs().into_iter().enumerate() {
            corpus.insert(format!("c{i}"), record.positive);
            queries.insert(format!("q{i}"), record.anchor);
            relevant.insert(format!("q{i}"), vec![format!("c{i}")]);
        }
        InformationRetrievalEvaluator::new(&queries, &corpus, &relevant, IrEvaluatorConfig::named("tiny"))
    }

    fn args(output_dir: &Path) -> TrainingArguments {
        TrainingArguments {
            num_train_epochs: 3,
            learning_rate: 1e-3,
            logging_steps: 1,
            save_total_limit: Some(2),
            metric_for_best_model: Some("tiny_cosine_ndcg@10".to_string()),
            ..TrainingArguments::new(output_dir)
        }
    }

    #[test]
    fn test_step_metrics_display() {
        let metrics = StepMetrics {
            global_step: 100,
            epoch: 1.5,
            loss: 0.5,
            grad_norm: 2.0,
            learning_rate: 5e-5,
            samples_per_second: 32.5,
        };
        let display = metrics.to_string();
        assert!(display.contains("Step 100"));
        assert!(display.contains("Epoch 1.50"));
        assert!(display.contains("Loss: 0.5000"));
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = SentenceEncoder::from_dir(write_tiny_model(&dir.path().join("m")), &Device::Cpu).unwrap();
        let result = Trainer::new(
            model,
            args(&dir.path().join("out")),
            PairDataset::default(),
            MultipleNegativesRankingLoss::default(),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_train_checkpoints_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("ft_tiny");
        let model = SentenceEncoder::from_dir(write_tiny_model(&dir.path().join("tiny")), &Device::Cpu).unwrap();

        let mut trainer = Trainer::new(
            model,
            args(&output_dir),
            PairDataset::new(pairs()),
            MultipleNegativesRankingLoss::default(),
            Some(evaluator()),
        )
        .unwrap();

        let output = trainer.train().unwrap();

        // 5 records / batch 2 -> 3 batches -> 2 steps per epoch (last one flushed)
        assert_eq!(output.global_step, 6);
        assert!(output.training_loss.is_finite());
        assert!(output.best_checkpoint.is_some());

        let state = trainer.state();
        assert_eq!(state.max_steps, 6);
        assert!(state
            .log_history
            .iter()
            .any(|e| e.values.contains_key("eval_tiny_cosine_ndcg@10")));
        assert!(state.log_history.iter().any(|e| e.values.contains_key("loss")));

        // at most two checkpoints remain, the best among them
        let remaining: Vec<_> = std::fs::read_dir(&output_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("checkpoint-"))
            .collect();
        assert!(remaining.len() <= 2);
        let best = output.best_checkpoint.unwrap();
        assert!(best.join(WEIGHTS_FILE).exists());
        assert!(best.join(TRAINER_STATE_FILE).exists());

        let saved = trainer.save_model().unwrap();
        assert!(saved.join(WEIGHTS_FILE).exists());
        assert!(saved.join(TRAINING_ARGS_FILE).exists());
        assert!(SentenceEncoder::from_dir(&saved, &Device::Cpu).is_ok());
    }

    #[test]
    fn test_train_with_negatives_and_steps_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("ft_tiny");
        let model = SentenceEncoder::from_dir(write_tiny_model(&dir.path().join("tiny")), &Device::Cpu).unwrap();

        let records: Vec<TrainingRecord> = pairs()
            .into_iter()
            .zip(["a snake", "the sea", "a boat", "cargo", "rust is fast"])
            .map(|(r, n)| r.with_negative(n))
            .collect();
        let args = TrainingArguments {
            num_train_epochs: 1,
            gradient_accumulation_steps: 1,
            eval_strategy: IntervalStrategy::Steps,
            eval_steps: Some(2),
            save_strategy: IntervalStrategy::Steps,
            save_steps: Some(2),
            save_total_limit: None,
            ..args(&output_dir)
        };

        let mut trainer = Trainer::new(
            model,
            args,
            PairDataset::new(records),
            MultipleNegativesRankingLoss::default(),
            Some(evaluator()),
        )
        .unwrap();
        let output = trainer.train().unwrap();

        assert_eq!(output.global_step, 3);
        assert!(output_dir.join("checkpoint-2").exists());
        assert!(!output_dir.join("checkpoint-3").exists());
    }

    #[test]
    fn test_seeded_runs_with_dropout_match() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = write_tiny_model_with_dropout(&dir.path().join("tiny"), 0.2);
        let texts: Vec<String> = pairs().into_iter().map(|r| r.anchor).collect();

        let train = |name: &str| {
            let model = SentenceEncoder::from_dir(&model_dir, &Device::Cpu).unwrap();
            let mut trainer = Trainer::new(
                model,
                TrainingArguments {
                    num_train_epochs: 1,
                    seed: 7,
                    ..args(&dir.path().join(name))
                },
                PairDataset::new(pairs()),
                MultipleNegativesRankingLoss::default(),
                Some(evaluator()),
            )
            .unwrap();
            trainer.train().unwrap();
            trainer.model().encode(&texts, 8).unwrap()
        };

        let (a, b) = (train("run_a"), train("run_b"));
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }
}
