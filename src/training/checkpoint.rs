//! Checkpoint saving, rotation and best-model tracking
//!
//! Each checkpoint is a full model directory named `checkpoint-{step}` under
//! the output directory, with a `trainer_state.json` beside the weights.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::models::SentenceEncoder;

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One line of the training log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

/// Progress of a run, persisted with every checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<PathBuf>,
    pub log_history: Vec<LogEntry>,
    pub device: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TrainerState {
    pub fn log(&mut self, values: BTreeMap<String, f64>) {
        self.log_history.push(LogEntry {
            step: self.global_step,
            epoch: self.epoch,
            values,
        });
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// Saves checkpoints, keeps at most `save_total_limit` of them and
/// remembers which one scored best
#[derive(Debug)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: Option<usize>,
    metric_key: String,
    higher_is_better: bool,
    checkpoints: Vec<(usize, PathBuf)>,
    best: Option<(PathBuf, f64)>,
}

impl CheckpointManager {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        save_total_limit: Option<usize>,
        metric_key: impl Into<String>,
        higher_is_better: bool,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_total_limit,
            metric_key: metric_key.into(),
            higher_is_better,
            checkpoints: Vec::new(),
            best: None,
        }
    }

    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
    }

    /// Save `model` as `checkpoint-{step}`, update the best checkpoint from
    /// `metrics` and rotate old checkpoints
    pub fn save(
        &mut self,
        model: &SentenceEncoder,
        state: &mut TrainerState,
        metrics: Option<&BTreeMap<String, f64>>,
    ) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(state.global_step);
        model
            .save(&dir)
            .with_context(|| format!("Failed to save checkpoint {:?}", dir))?;

        let metric = metrics.and_then(|m| m.get(&self.metric_key)).copied();
        if metrics.is_some() && metric.is_none() {
            tracing::warn!(
                "Metric {} missing from evaluation results; best checkpoint not updated",
                self.metric_key
            );
        }
        self.register(state.global_step, dir.clone(), metric);

        if let Some((path, value)) = &self.best {
            state.best_model_checkpoint = Some(path.clone());
            state.best_metric = Some(*value);
        }
        state.updated_at = Some(Utc::now());
        state.save(&dir.join(TRAINER_STATE_FILE))?;

        tracing::info!("Saved checkpoint to {:?}", dir);
        self.rotate()?;
        Ok(dir)
    }

    /// Record a checkpoint directory and its metric value
    pub fn register(&mut self, step: usize, dir: PathBuf, metric: Option<f64>) {
        if let Some(value) = metric {
            if self.is_better(value) {
                tracing::info!(
                    "New best {} = {:.4} at {:?}",
                    self.metric_key,
                    value,
                    dir
                );
                self.best = Some((dir.clone(), value));
            }
        }
        self.checkpoints.retain(|(_, p)| p != &dir);
        self.checkpoints.push((step, dir));
        self.checkpoints.sort_by_key(|(s, _)| *s);
    }

    fn is_better(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        match &self.best {
            None => true,
            Some((_, best)) if self.higher_is_better => value > *best,
            Some((_, best)) => value < *best,
        }
    }

    /// Delete the oldest checkpoints beyond the limit, never the best one
    pub fn rotate(&mut self) -> Result<()> {
        let Some(limit) = self.save_total_limit else {
            return Ok(());
        };
        let best = self.best.as_ref().map(|(p, _)| p.clone());

        while self.checkpoints.len() > limit.max(1) {
            let Some(index) = self
                .checkpoints
                .iter()
                .position(|(_, p)| Some(p) != best.as_ref())
            else {
                break;
            };
            // the newest checkpoint always stays
            if index == self.checkpoints.len() - 1 {
                break;
            }
            let (_, dir) = self.checkpoints.remove(index);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("Failed to delete checkpoint {:?}", dir))?;
            }
            tracing::info!("Deleted old checkpoint {:?}", dir);
        }
        Ok(())
    }

    pub fn best_checkpoint(&self) -> Option<&Path> {
        self.best.as_ref().map(|(p, _)| p.as_path())
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best.as_ref().map(|(_, v)| *v)
    }

    /// Checkpoints currently on disk, oldest first
    pub fn checkpoints(&self) -> Vec<&Path> {
        self.checkpoints.iter().map(|(_, p)| p.as_path()).collect()
    }

    pub fn metric_key(&self) -> &str {
        &self.metric_key
    }
}
