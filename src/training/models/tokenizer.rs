//! Tokenizer wrapper for HuggingFace tokenizers
//!
//! Pads each batch to its longest member and truncates to the model's
//! maximum sequence length.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use std::path::Path;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// Wrapper around a HuggingFace tokenizer configured for batch encoding
#[derive(Clone)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl TokenizerWrapper {
    /// Load tokenizer from a `tokenizer.json` file
    pub fn from_file(path: impl AsRef<Path>, max_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow!("Failed to load tokenizer {:?}: {}", path.as_ref(), e))?;
        Self::new(tokenizer, max_length)
    }

    pub fn new(mut tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        let pad_id = tokenizer.get_padding().map(|p| p.pad_id).unwrap_or(0);
        let pad_token = tokenizer
            .get_padding()
            .map(|p| p.pad_token.clone())
            .unwrap_or_else(|| "[PAD]".to_string());

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            pad_id,
            pad_token,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to set truncation: {}", e))?;

        Ok(Self { tokenizer, max_length })
    }

    /// Get the maximum sequence length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Encode a batch of texts with padding and truncation
    pub fn encode_batch(&self, texts: &[String]) -> Result<BatchEncodedInput> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Batch tokenization failed: {}", e))?;

        let batch_size = encodings.len();
        // an all-empty batch still gets one (masked) position
        let seq_len = encodings
            .first()
            .map(|e| e.get_ids().len())
            .unwrap_or(0)
            .max(1);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            input_ids.extend_from_slice(ids);
            attention_mask.extend_from_slice(mask);
            for _ in ids.len()..seq_len {
                input_ids.push(0);
                attention_mask.push(0);
            }
        }

        Ok(BatchEncodedInput {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        })
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

/// Batch encoded input, flattened row-major
#[derive(Debug, Clone)]
pub struct BatchEncodedInput {
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
    pub batch_size: usize,
    /// Sequence length after padding
    pub seq_len: usize,
}

impl BatchEncodedInput {
    /// Convert to (input_ids u32, attention_mask f32) tensors [batch_size, seq_len]
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let input_ids = Tensor::new(&self.input_ids[..], device)?
            .reshape((self.batch_size, self.seq_len))?;

        let attention_mask = Tensor::new(&self.attention_mask[..], device)?
            .to_dtype(DType::F32)?
            .reshape((self.batch_size, self.seq_len))?;

        Ok((input_ids, attention_mask))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Whitespace word-level tokenizer over a fixed vocabulary
    pub(crate) fn word_level_tokenizer_json(words: &[&str]) -> String {
        let mut vocab = serde_json::Map::new();
        vocab.insert("[PAD]".to_string(), 0.into());
        vocab.insert("[UNK]".to_string(), 1.into());
        for (i, word) in words.iter().enumerate() {
            vocab.insert(word.to_string(), (i + 2).into());
        }
        serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
        })
        .to_string()
    }

    fn tokenizer(max_length: usize) -> TokenizerWrapper {
        let json = word_level_tokenizer_json(&["hello", "world", "rust"]);
        let tokenizer: Tokenizer = json.parse().unwrap();
        TokenizerWrapper::new(tokenizer, max_length).unwrap()
    }

    #[test]
    fn test_batch_is_padded_to_longest() {
        let tok = tokenizer(16);
        let batch = tok
            .encode_batch(&["hello world rust".to_string(), "hello".to_string()])
            .unwrap();

        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.seq_len, 3);
        assert_eq!(batch.input_ids, vec![2, 3, 4, 2, 0, 0]);
        assert_eq!(batch.attention_mask, vec![1, 1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_truncation_and_unknown_words() {
        let tok = tokenizer(2);
        let batch = tok.encode_batch(&["rust is hello".to_string()]).unwrap();
        assert_eq!(batch.input_ids, vec![4, 1]);

        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[1, 2]);
        assert_eq!(mask.dtype(), DType::F32);
    }

    #[test]
    fn test_empty_text_gets_one_masked_position() {
        let tok = tokenizer(8);
        let batch = tok.encode_batch(&[String::new()]).unwrap();
        assert_eq!(batch.seq_len, 1);
        assert_eq!(batch.attention_mask, vec![0]);
    }
}
