//! Typed errors for input validation
//!
//! Everything that can be rejected before a model touches a device lives here.
//! Runtime failures from candle or the tokenizer flow through `anyhow`.

use std::path::PathBuf;

use thiserror::Error;

/// Which map of a relevance dataset an id was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMap {
    Corpus,
    Queries,
}

impl std::fmt::Display for DatasetMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corpus => write!(f, "corpus"),
            Self::Queries => write!(f, "queries"),
        }
    }
}

/// Errors raised while reading or reshaping a relevance dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The dataset file could not be read.
    #[error("Failed to read dataset {path:?}: {source}")]
    Io {
        /// File that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Invalid JSON, a missing top-level key, or a mistyped value.
    #[error("Malformed dataset {path:?}: {message}")]
    Malformed {
        /// File that was being parsed
        path: PathBuf,
        /// What is wrong with it
        message: String,
    },

    /// A relevance entry points at an id that is absent from its map.
    #[error("Dangling reference in {path:?}: {map} id '{id}' referenced by query '{query_id}' does not exist")]
    DanglingReference {
        /// File that was being reshaped
        path: PathBuf,
        /// Map the id was looked up in
        map: DatasetMap,
        /// Missing id
        id: String,
        /// Relevance entry that referenced it
        query_id: String,
    },
}

impl DatasetError {
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn dangling(
        path: impl Into<PathBuf>,
        map: DatasetMap,
        id: impl Into<String>,
        query_id: impl Into<String>,
    ) -> Self {
        Self::DanglingReference {
            path: path.into(),
            map,
            id: id.into(),
            query_id: query_id.into(),
        }
    }
}

/// Errors in the run configuration, raised before any file is parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Model directory not found: {0:?}")]
    MissingModel(PathBuf),

    #[error("Dataset file not found: {0:?}")]
    MissingDataset(PathBuf),

    #[error("Invalid value '{value}' for {option}: {reason}")]
    InvalidValue {
        option: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid_value(option: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            option,
            value: value.into(),
            reason: reason.into(),
        }
    }
}
