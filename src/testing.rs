//! Deterministic stand-ins for the embedding and generation ports.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::generation::Generator;

/// Embeds only the texts it was taught; anything else is an upstream failure.
pub struct TableEmbedder {
    dimension: usize,
    table: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            table: HashMap::new(),
        }
    }

    pub fn with(mut self, text: &str, vector: &[f32]) -> Self {
        self.table.insert(text.to_string(), vector.to_vec());
        self
    }
}

impl Embedder for TableEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.table
            .get(text)
            .cloned()
            .ok_or_else(|| MemoryError::Upstream(format!("no embedding for {text:?}")))
    }
}

/// Replies with a fixed answer (or error) and remembers every prompt it saw.
pub struct ScriptedGenerator {
    reply: std::result::Result<String, String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    images: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn answering(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
        }
    }

    pub fn slow(reply: &str, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::answering(reply)
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn images(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone().map_err(MemoryError::Upstream)
    }

    async fn generate_with_image(&self, prompt: &str, image: &str) -> Result<String> {
        self.images.lock().unwrap().push(image.to_string());
        self.generate(prompt).await
    }
}
