//! # Embedding port
//!
//! Text → fixed-length vector. The store and the retrieval policy only see the
//! [`Embedder`] trait; [`MiniLmEmbedder`] is the production implementation, a
//! BERT sentence encoder run with Candle whose weights are fetched from the
//! Hugging Face Hub on first use and cached afterwards.
//!
//! ```no_run
//! use chat_recall::embedding::{Embedder, EmbeddingDevice, EmbeddingOptions, MiniLmEmbedder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = MiniLmEmbedder::load(&EmbeddingOptions {
//!     model_id: "sentence-transformers/all-MiniLM-L6-v2".into(),
//!     revision: "main".into(),
//!     device: EmbeddingDevice::Cpu,
//!     dimension: 384,
//! })?;
//! let v = model.embed("What is the capital of France?")?;
//! assert_eq!(v.len(), 384);
//! # Ok(()) }
//! ```

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{
    Repo, RepoType,
    api::sync::{Api, ApiError},
};
use serde::{Deserialize, Serialize};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::error::{MemoryError, Result};

/// BERT position embeddings stop here; longer inputs are truncated.
const MAX_TOKENS: usize = 512;

/// Maps text to a vector of [`dimension`](Embedder::dimension) floats.
///
/// Implementations must be deterministic for a fixed model. Failures are
/// reported as [`MemoryError::Upstream`].
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Where the encoder runs.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingDevice {
    #[default]
    Cpu,
    /// First CUDA device; needs a Candle build with CUDA support.
    Cuda,
}

impl EmbeddingDevice {
    fn open(self) -> Result<Device> {
        match self {
            EmbeddingDevice::Cpu => Ok(Device::Cpu),
            EmbeddingDevice::Cuda => {
                Device::new_cuda(0).map_err(|e| MemoryError::upstream("opening CUDA device", e))
            }
        }
    }
}

/// Which encoder to load and what it must produce.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingOptions {
    /// Hugging Face repository id.
    pub model_id: String,
    /// Branch, tag or commit of the repository.
    pub revision: String,
    pub device: EmbeddingDevice,
    /// Width the store was built for; every embedding is checked against it.
    pub dimension: usize,
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    fn fetch(options: &EmbeddingOptions) -> Result<Self> {
        let hub = |e: ApiError| MemoryError::upstream("fetching embedding model", e);
        let repo = Api::new().map_err(hub)?.repo(Repo::with_revision(
            options.model_id.clone(),
            RepoType::Model,
            options.revision.clone(),
        ));
        Ok(Self {
            config: repo.get("config.json").map_err(hub)?,
            tokenizer: repo.get("tokenizer.json").map_err(hub)?,
            weights: repo.get("model.safetensors").map_err(hub)?,
        })
    }
}

/// Sentence embeddings from a BERT-family model (mean pooled, L2 normalised).
pub struct MiniLmEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl MiniLmEmbedder {
    /// Fetch (or reuse the cached) model from the Hub and load it on the configured device.
    pub fn load(options: &EmbeddingOptions) -> Result<Self> {
        info!(
            "Loading embedding model {}@{} on {:?}",
            options.model_id, options.revision, options.device
        );
        let device = options.device.open()?;
        let files = ModelFiles::fetch(options)?;

        let config: Config = std::fs::read_to_string(&files.config)
            .map_err(|e| MemoryError::upstream("reading model config", e))
            .and_then(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| MemoryError::upstream("parsing model config", e))
            })?;

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| MemoryError::upstream("loading tokenizer", e))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_TOKENS,
                ..TruncationParams::default()
            }))
            .map_err(|e| MemoryError::upstream("configuring tokenizer", e))?;

        // SAFETY: the safetensors file lives in the hub cache and is not modified while mapped.
        let weights =
            unsafe { VarBuilder::from_mmaped_safetensors(&[files.weights], DTYPE, &device) }
                .map_err(|e| MemoryError::upstream("mapping model weights", e))?;
        let model = BertModel::load(weights, &config)
            .map_err(|e| MemoryError::upstream("building BERT model", e))?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension: options.dimension,
        })
    }

    fn forward(&self, text: &str) -> candle_core::Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| candle_core::Error::Msg(format!("tokenizing: {e}")))?;

        let ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let hidden = self.model.forward(&ids, &type_ids, None)?;

        let pooled = mean_pool(&hidden, encoding.get_attention_mask())?;
        l2_normalize(&pooled)?.to_vec1::<f32>()
    }
}

/// Average the `[1, seq, hidden]` states over the positions `mask` keeps.
fn mean_pool(hidden: &Tensor, mask: &[u32]) -> candle_core::Result<Tensor> {
    let kept = mask.iter().filter(|&&m| m != 0).count().max(1);
    let weights = Tensor::new(mask, hidden.device())?
        .to_dtype(hidden.dtype())?
        .reshape((1, 1, mask.len()))?;
    (weights.matmul(&hidden.contiguous()?)? / kept as f64)?.flatten_all()
}

fn l2_normalize(v: &Tensor) -> candle_core::Result<Tensor> {
    let norm = v.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
    if norm == 0.0 {
        return Ok(v.clone());
    }
    v / norm as f64
}

impl Embedder for MiniLmEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .forward(text)
            .map_err(|e| MemoryError::upstream("embedding text", e))?;
        debug!("Embedded {} chars into {} dims", text.len(), vector.len());

        if vector.len() != self.dimension {
            return Err(MemoryError::Upstream(format!(
                "embedding model produced {} dimensions, store is configured for {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(vector)
    }
}
