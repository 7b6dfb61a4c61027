//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the `RecallConfig` struct, which holds the configuration parameters,
//! and a `load_config` function to load the configuration from a YAML file.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use chat_recall::config::load_config;
//!
//! let config = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config);
//! ```
//!
//! A minimal file only needs the generation endpoint:
//!
//! ```yaml
//! api_base: "http://localhost:11434/api/generate"
//! model: "llama3"
//! ```
//!
//! Everything else falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::PathBuf, time::Duration};

use crate::embedding::{EmbeddingDevice, EmbeddingOptions};
use crate::error::{MemoryError, Result};
use crate::policy::RetrievalSettings;

/// Which wire protocol the generation backend speaks.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// OpenAI-compatible `/chat/completions`; `api_base` is the API root.
    OpenAi,
    /// Plain JSON generate endpoint; `api_base` is the full URL.
    #[default]
    Generate,
}

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RecallConfig {
    /// The API key used to authenticate requests to the generation backend.
    #[serde(default)]
    pub api_key: String,

    /// Base URL (OpenAI) or full endpoint URL (generate) of the backend.
    pub api_base: String,

    /// The name of the model to be used for generating responses.
    pub model: String,

    #[serde(default)]
    pub backend: Backend,

    /// Where the memory artifact lives. Defaults to `<config_dir>/data/vector_db.bin`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Embedding width; must match the embedding model.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// How many neighbours to retrieve per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Similarity a memory must exceed to be used as context.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    // Upper bound on a single generation call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Completion token cap (OpenAI backend only).
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Hugging Face model id of the sentence encoder.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Hub revision of `embedding_model`; pin a commit for reproducible vectors.
    #[serde(default = "default_embedding_revision")]
    pub embedding_revision: String,

    #[serde(default)]
    pub embedding_device: EmbeddingDevice,
}

fn default_dimension() -> usize {
    384
}

fn default_top_k() -> usize {
    3
}

fn default_relevance_threshold() -> f32 {
    0.5
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_embedding_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

fn default_embedding_revision() -> String {
    "main".to_string()
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "http://localhost:11434/api/generate".to_string(),
            model: "llama3".to_string(),
            backend: Backend::default(),
            db_path: None,
            dimension: default_dimension(),
            top_k: default_top_k(),
            relevance_threshold: default_relevance_threshold(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens: None,
            embedding_model: default_embedding_model(),
            embedding_revision: default_embedding_revision(),
            embedding_device: EmbeddingDevice::default(),
        }
    }
}

impl RecallConfig {
    /// Reject values the store or the policy cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(MemoryError::Config("dimension must be at least 1".into()));
        }
        if self.top_k == 0 {
            return Err(MemoryError::Config("top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.relevance_threshold) {
            return Err(MemoryError::Config(format!(
                "relevance_threshold {} is outside [0, 1]",
                self.relevance_threshold
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(MemoryError::Config(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The configured artifact path, or the default under the config directory.
    pub fn db_path(&self) -> std::result::Result<PathBuf, Box<dyn Error>> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(crate::config_dir()?.join("data").join("vector_db.bin")),
        }
    }

    /// Replace `top_k` (e.g. from the command line), re-checking the result.
    pub fn with_top_k(mut self, top_k: usize) -> Result<Self> {
        self.top_k = top_k;
        self.validate()?;
        Ok(self)
    }

    pub fn embedding_options(&self) -> EmbeddingOptions {
        EmbeddingOptions {
            model_id: self.embedding_model.clone(),
            revision: self.embedding_revision.clone(),
            device: self.embedding_device,
            dimension: self.dimension,
        }
    }

    pub fn retrieval_settings(&self) -> RetrievalSettings {
        RetrievalSettings {
            top_k: self.top_k,
            relevance_threshold: self.relevance_threshold,
            generation_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// Loads the application's configuration from a YAML file.
///
/// This function reads the file at the given path, parses it as YAML,
/// fills in defaults, and validates the result.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML does not parse, or a
/// value fails [`RecallConfig::validate`].
pub fn load_config(file: &str) -> std::result::Result<RecallConfig, Box<dyn Error>> {
    tracing::debug!("Loading config from {file}");
    let content = fs::read_to_string(file)?;
    let config: RecallConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
