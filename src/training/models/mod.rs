//! Sentence-embedding models
//!
//! A [`SentenceEncoder`] is a trainable BERT encoder plus its tokenizer and
//! pooling layer, loaded from and saved to a sentence-embedding model
//! directory.

mod bert;
mod pooling;
mod tokenizer;

pub use bert::{load_pretrained, BertConfig, BertModel, HiddenAct, LayerNorm, SeededDropout};
pub use pooling::{apply_pooling, cosine_similarity, normalize_embeddings, PoolingStrategy};
pub use tokenizer::{BatchEncodedInput, TokenizerWrapper};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::hub::{ModelPath, AUXILIARY_FILES, WEIGHTS_FILE};

const DEFAULT_MAX_SEQ_LENGTH: usize = 512;
const SENTENCE_CONFIG_FILE: &str = "sentence_bert_config.json";
const POOLING_CONFIG_FILE: &str = "1_Pooling/config.json";

/// Anything that maps texts to embedding rows
pub trait EmbeddingModel {
    /// Embeddings [texts.len(), dim], computed in chunks of `batch_size`,
    /// detached from the graph and not normalized
    fn encode(&self, texts: &[String], batch_size: usize) -> Result<Tensor>;

    fn embedding_dim(&self) -> usize;

    fn device(&self) -> &Device;
}

/// `sentence_bert_config.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SentenceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_seq_length: Option<usize>,
    #[serde(default)]
    do_lower_case: bool,
}

impl SentenceConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// Trainable sentence encoder
pub struct SentenceEncoder {
    bert: BertModel,
    varmap: VarMap,
    tokenizer: TokenizerWrapper,
    pooling: PoolingStrategy,
    sentence_config: SentenceConfig,
    model_path: ModelPath,
    device: Device,
}

impl SentenceEncoder {
    /// Load config, weights, tokenizer and pooling from a resolved model directory
    pub fn load(model_path: &ModelPath, device: &Device) -> Result<Self> {
        let config = BertConfig::from_file(&model_path.config_file)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let bert = BertModel::load(vb, &config)?;
        load_pretrained(&varmap, &model_path.weights_file, device)?;

        let sentence_config = match &model_path.sentence_config_file {
            Some(path) => SentenceConfig::from_file(path)?,
            None => SentenceConfig::default(),
        };
        let pooling = match &model_path.pooling_config_file {
            Some(path) => PoolingStrategy::from_config_file(path)?,
            None => PoolingStrategy::default(),
        };

        let max_seq_length = sentence_config
            .max_seq_length
            .unwrap_or(DEFAULT_MAX_SEQ_LENGTH)
            .min(config.max_sequence_length());
        let tokenizer = TokenizerWrapper::from_file(&model_path.tokenizer_file, max_seq_length)?;

        let encoder = Self {
            bert,
            varmap,
            tokenizer,
            pooling,
            sentence_config,
            model_path: model_path.clone(),
            device: device.clone(),
        };

        tracing::info!(
            "Loaded encoder {} (hidden_size: {}, layers: {}, params: {}, pooling: {}, max_seq_length: {})",
            model_path.model_id,
            config.hidden_size,
            config.num_hidden_layers,
            encoder.num_parameters(),
            pooling,
            max_seq_length
        );

        Ok(encoder)
    }

    /// Load from a local model directory
    pub fn from_dir(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        Self::load(&ModelPath::from_local(path)?, device)
    }

    /// Pooled embeddings [texts.len(), hidden], attached to the graph
    pub fn forward(&self, texts: &[String], train: bool) -> Result<Tensor> {
        let batch = if self.sentence_config.do_lower_case {
            let lowered: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
            self.tokenizer.encode_batch(&lowered)?
        } else {
            self.tokenizer.encode_batch(texts)?
        };
        let (input_ids, attention_mask) = batch.to_tensors(&self.device)?;
        tracing::trace!("Encoder input shape: {:?}", input_ids.dims());

        let hidden_states = self.bert.forward(&input_ids, &attention_mask, train)?;
        apply_pooling(&hidden_states, &attention_mask, self.pooling)
    }

    /// Reseed dropout so training forward passes repeat across runs
    pub fn set_seed(&self, seed: u64) -> Result<()> {
        self.bert.set_seed(seed)
    }

    /// Copy weights from a safetensors file into this encoder
    pub fn load_weights(&self, weights: &Path) -> Result<()> {
        load_pretrained(&self.varmap, weights, &self.device)
    }

    /// Write a loadable model directory: weights, configs and tokenizer files
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        self.varmap
            .save(dir.join(WEIGHTS_FILE))
            .with_context(|| format!("Failed to write weights to {:?}", dir))?;

        for name in AUXILIARY_FILES {
            let src = self.model_path.path.join(name);
            let dst = dir.join(name);
            if !src.exists() || src == dst {
                continue;
            }
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst).with_context(|| format!("Failed to copy {:?}", src))?;
        }

        let sentence_config = SentenceConfig {
            max_seq_length: Some(self.max_seq_length()),
            ..self.sentence_config.clone()
        };
        std::fs::write(
            dir.join(SENTENCE_CONFIG_FILE),
            serde_json::to_string_pretty(&sentence_config)?,
        )?;

        let pooling_path = dir.join(POOLING_CONFIG_FILE);
        if !pooling_path.exists() {
            if let Some(parent) = pooling_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = self.pooling.to_config_json(self.embedding_dim());
            std::fs::write(&pooling_path, serde_json::to_string_pretty(&json)?)?;
        }

        tracing::debug!("Saved model to {:?}", dir);
        Ok(())
    }

    /// Trainable parameters
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    pub fn max_seq_length(&self) -> usize {
        self.tokenizer.max_length()
    }

    /// Change the truncation length, capped by the position embeddings
    pub fn set_max_seq_length(&mut self, max_seq_length: usize) -> Result<()> {
        let capped = max_seq_length.min(self.bert.config().max_sequence_length());
        if capped != max_seq_length {
            tracing::warn!(
                "max_seq_length {} exceeds position embeddings, using {}",
                max_seq_length,
                capped
            );
        }
        let tokenizer = tokenizers::Tokenizer::from_file(&self.model_path.tokenizer_file)
            .map_err(|e| anyhow::anyhow!("Failed to reload tokenizer: {}", e))?;
        self.tokenizer = TokenizerWrapper::new(tokenizer, capped)?;
        Ok(())
    }

    pub fn pooling(&self) -> PoolingStrategy {
        self.pooling
    }

    pub fn config(&self) -> &BertConfig {
        self.bert.config()
    }

    /// Name the model was requested by
    pub fn name(&self) -> &str {
        &self.model_path.model_id
    }

    pub fn model_path(&self) -> &ModelPath {
        &self.model_path
    }
}

impl EmbeddingModel for SentenceEncoder {
    fn encode(&self, texts: &[String], batch_size: usize) -> Result<Tensor> {
        if texts.is_empty() {
            return Ok(Tensor::zeros((0, self.embedding_dim()), DType::F32, &self.device)?);
        }

        let chunks = texts
            .chunks(batch_size.max(1))
            .map(|chunk| Ok(self.forward(chunk, false)?.detach()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&chunks, 0)?)
    }

    fn embedding_dim(&self) -> usize {
        self.bert.config().hidden_size
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) const FIXTURE_WORDS: &[&str] = &[
        "what", "is", "rust", "python", "a", "language", "snake", "cargo", "ship", "fast", "slow",
        "the", "compiler", "borrow", "checker", "memory", "safe", "garbage", "collector", "how",
        "does", "work", "why", "use", "sea", "boat", "crate", "package", "manager", "foo", "bar",
        "baz", "qux",
    ];

    /// Write a tiny random BERT with a word-level tokenizer into `dir`
    pub(crate) fn write_tiny_model(dir: &Path) -> PathBuf {
        write_tiny_model_with_dropout(dir, 0.0)
    }

    pub(crate) fn write_tiny_model_with_dropout(dir: &Path, dropout: f64) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let config = serde_json::json!({
            "model_type": "bert",
            "vocab_size": FIXTURE_WORDS.len() + 2,
            "hidden_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 32,
            "hidden_dropout_prob": dropout,
            "attention_probs_dropout_prob": dropout,
            "max_position_embeddings": 64,
            "type_vocab_size": 2,
            "layer_norm_eps": 1e-12
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
        std::fs::write(
            dir.join("tokenizer.json"),
            tokenizer::tests::word_level_tokenizer_json(FIXTURE_WORDS),
        )
        .unwrap();

        let bert_config = BertConfig::from_file(dir.join("config.json")).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        BertModel::load(vb, &bert_config).unwrap();
        varmap.save(dir.join(WEIGHTS_FILE)).unwrap();

        dir.to_path_buf()
    }

    #[test]
    fn test_encode_shape_and_batching_agree() {
        let dir = tempfile::tempdir().unwrap();
        let model = SentenceEncoder::from_dir(write_tiny_model(&dir.path().join("m")), &Device::Cpu)
            .unwrap();

        let texts: Vec<String> = ["what is rust", "the borrow checker", "a snake"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let all = model.encode(&texts, 8).unwrap();
        let chunked = model.encode(&texts, 1).unwrap();

        assert_eq!(all.dims(), &[3, 16]);
        let diff = (all - chunked).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-4);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let model = SentenceEncoder::from_dir(write_tiny_model(&dir.path().join("m")), &Device::Cpu)
            .unwrap();
        let out = dir.path().join("saved");
        model.save(&out).unwrap();

        assert!(out.join(WEIGHTS_FILE).exists());
        assert!(out.join("tokenizer.json").exists());
        assert!(out.join(SENTENCE_CONFIG_FILE).exists());
        assert!(out.join(POOLING_CONFIG_FILE).exists());

        let reloaded = SentenceEncoder::from_dir(&out, &Device::Cpu).unwrap();
        assert_eq!(reloaded.max_seq_length(), model.max_seq_length());
        let texts = vec!["rust is fast".to_string()];
        let a = model.encode(&texts, 4).unwrap();
        let b = reloaded.encode(&texts, 4).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_max_seq_length_defaults_to_position_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut model =
            SentenceEncoder::from_dir(write_tiny_model(&dir.path().join("m")), &Device::Cpu).unwrap();
        assert_eq!(model.max_seq_length(), 64);

        model.set_max_seq_length(1000).unwrap();
        assert_eq!(model.max_seq_length(), 64);
        model.set_max_seq_length(8).unwrap();
        assert_eq!(model.max_seq_length(), 8);
    }

    #[test]
    fn test_do_lower_case_lowers_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tiny_model(&dir.path().join("m"));
        let texts = vec!["What Is RUST".to_string()];
        let lower = vec!["what is rust".to_string()];

        // the fixture vocabulary is lowercase, so cased words map to [UNK]
        let cased = SentenceEncoder::from_dir(&path, &Device::Cpu).unwrap();
        let diff = (cased.encode(&texts, 4).unwrap() - cased.encode(&lower, 4).unwrap()).unwrap();
        assert!(diff.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap() > 1e-4);

        std::fs::write(path.join(SENTENCE_CONFIG_FILE), r#"{"do_lower_case": true}"#).unwrap();
        let model = SentenceEncoder::from_dir(&path, &Device::Cpu).unwrap();
        let diff = (model.encode(&texts, 4).unwrap() - model.encode(&lower, 4).unwrap()).unwrap();
        assert_eq!(diff.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_seeded_training_forward_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tiny_model_with_dropout(&dir.path().join("m"), 0.2);
        let texts: Vec<String> = ["what is rust", "a snake"].iter().map(|s| s.to_string()).collect();

        let run = || {
            let model = SentenceEncoder::from_dir(&path, &Device::Cpu).unwrap();
            model.set_seed(13).unwrap();
            model.forward(&texts, true).unwrap()
        };
        let (a, b) = (run(), run());
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_empty_input_encodes_to_empty_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let model = SentenceEncoder::from_dir(write_tiny_model(&dir.path().join("m")), &Device::Cpu)
            .unwrap();
        assert_eq!(model.encode(&[], 4).unwrap().dims(), &[0, 16]);
    }
}
