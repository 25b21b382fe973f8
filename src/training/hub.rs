//! Model directory resolution
//!
//! A model is a directory holding `config.json`, `model.safetensors` and a
//! `tokenizer.json`, optionally with the sentence-embedding side files
//! (`sentence_bert_config.json`, `modules.json`, `1_Pooling/config.json`).
//! Local directories are used as-is; anything else is fetched from the
//! HuggingFace Hub.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Files copied alongside the weights when a model directory is saved
pub const AUXILIARY_FILES: &[&str] = &[
    "config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.txt",
    "sentence_bert_config.json",
    "config_sentence_transformers.json",
    "modules.json",
    "1_Pooling/config.json",
];

/// Weights file name inside a model directory
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Resolved model files
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Name the model was requested by
    pub model_id: String,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Path to model.safetensors
    pub weights_file: PathBuf,
    /// Path to tokenizer.json
    pub tokenizer_file: PathBuf,
    /// Path to sentence_bert_config.json, if present
    pub sentence_config_file: Option<PathBuf>,
    /// Path to 1_Pooling/config.json, if present
    pub pooling_config_file: Option<PathBuf>,
}

impl ModelPath {
    /// Create a ModelPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.is_dir() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let model_path = Self {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            config_file: path.join("config.json"),
            weights_file: path.join(WEIGHTS_FILE),
            tokenizer_file: path.join("tokenizer.json"),
            sentence_config_file: existing(path.join("sentence_bert_config.json")),
            pooling_config_file: existing(path.join("1_Pooling").join("config.json")),
            path,
        };
        model_path.validate()?;
        Ok(model_path)
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", self.path));
        }
        if !self.weights_file.exists() {
            return Err(anyhow!(
                "{} not found in {:?} (only safetensors weights are supported)",
                WEIGHTS_FILE,
                self.path
            ));
        }
        if !self.tokenizer_file.exists() {
            return Err(anyhow!("tokenizer.json not found in {:?}", self.path));
        }
        Ok(())
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

/// Download a model from the HuggingFace Hub into the local cache
pub fn download_model(model_id: &str) -> Result<ModelPath> {
    tracing::info!("Downloading model from HuggingFace Hub: {}", model_id);

    let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
    let repo = api.model(model_id.to_string());

    let config_file = repo.get("config.json").context("Failed to download config.json")?;
    let weights_file = repo
        .get(WEIGHTS_FILE)
        .context("Failed to download model.safetensors")?;
    let tokenizer_file = repo
        .get("tokenizer.json")
        .context("Failed to download tokenizer.json")?;

    let optional = |name: &str| match repo.get(name) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::debug!("Optional file {} not available: {}", name, e);
            None
        }
    };
    let sentence_config_file = optional("sentence_bert_config.json");
    let pooling_config_file = optional("1_Pooling/config.json");
    for name in ["tokenizer_config.json", "special_tokens_map.json", "modules.json"] {
        optional(name);
    }

    let path = config_file
        .parent()
        .ok_or_else(|| anyhow!("Invalid config path"))?
        .to_path_buf();

    Ok(ModelPath {
        path,
        model_id: model_id.to_string(),
        config_file,
        weights_file,
        tokenizer_file,
        sentence_config_file,
        pooling_config_file,
    })
}

/// Resolve a model: local directory first, HuggingFace Hub otherwise
///
/// Names that look like filesystem paths (`.`, `/`, `~` prefixes) are never
/// sent to the Hub.
pub fn resolve_model(model_dir: &Path, model_id: &str) -> Result<ModelPath> {
    if model_dir.exists() {
        tracing::info!("Loading model from local path: {:?}", model_dir);
        return ModelPath::from_local(model_dir);
    }

    if model_id.starts_with('.') || model_id.starts_with('/') || model_id.starts_with('~') {
        return Err(ConfigError::MissingModel(model_dir.to_path_buf()).into());
    }

    download_model(model_id)
}
