//! # Retrieval-augmentation policy
//!
//! Decides, per query, whether earlier answers should be handed to the
//! generation backend as context, then remembers the new exchange.
//!
//! ```text
//!   query ──embed──▶ search top_k ──▶ similarity > θ ?
//!                                        │yes            │no
//!                                   AUGMENTED         DIRECT
//!                          (context + question)    (question only)
//!                                        └──── generate ────┘
//!                                                 │ ok
//!                                   add {query, response, used_context}
//!                                                 │
//!                                               save
//! ```
//!
//! A failed embedding or generation aborts the run before anything is
//! committed. A failed save does not: the answer is returned, the memory stays
//! in RAM, and [`ChatOutcome::persisted`] is `false`.
//!
//! Full runs are serialised by a per-policy run lock, so a run always retrieves
//! against every exchange committed before it. Inside a run, retrieval holds the
//! store's read lock and the add-then-save commit holds the write lock for its
//! whole duration. [`RetrievalPolicy::recall`] skips the run lock: it may see the
//! store before or after a concurrent commit, never a record without its vector.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::generation::Generator;
use crate::index::{FlatIndex, SimilarityIndex};
use crate::persistence::Persistence;
use crate::records::Extra;
use crate::store::{Hit, Store};

/// Tunables for one policy instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalSettings {
    /// Neighbours fetched per query.
    pub top_k: usize,
    /// A hit is relevant when its similarity is strictly greater than this.
    pub relevance_threshold: f32,
    pub generation_timeout: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            relevance_threshold: 0.5,
            generation_timeout: Duration::from_secs(60),
        }
    }
}

/// Whether a query is answered with prior context.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Augmented { context: String },
    Direct,
}

/// Steps 1 and 2 of a run: what the store returned and what survived the threshold.
#[derive(Debug, Clone)]
pub struct Retrieval {
    /// Embedding of the query, reused when the exchange is committed.
    pub vector: Vec<f32>,
    /// Every neighbour returned by the search, closest first.
    pub hits: Vec<Hit>,
    /// The subset of `hits` above the relevance threshold, same order.
    pub relevant: Vec<Hit>,
}

impl Retrieval {
    pub fn mode(&self) -> Mode {
        if self.relevant.is_empty() {
            Mode::Direct
        } else {
            Mode::Augmented {
                context: build_context(&self.relevant),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DebugInfo {
    pub used_context: bool,
    pub similar_messages_count: usize,
    pub vector_db_size: usize,
}

/// Result of one full run, shaped like the chat endpoint's response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatOutcome {
    pub response: String,
    pub debug: DebugInfo,
    /// `false` when the exchange is only held in memory.
    #[serde(skip)]
    pub persisted: bool,
}

/// One `Previous Q&A` block per hit, in the order given.
pub fn build_context(hits: &[Hit]) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "Previous Q&A ({}):\nQ: {}\nA: {}",
                hit.record.timestamp.to_rfc3339(),
                hit.record.text,
                hit.record.response().unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The single payload handed to the generation backend.
pub fn build_prompt(query: &str, mode: &Mode) -> String {
    match mode {
        Mode::Direct => query.to_string(),
        Mode::Augmented { context } => format!(
            "Earlier questions and answers that may be related:\n\
             {context}\n\n\
             Let this context inform your answer, but do not let it override \
             what is factually correct. Keep the reply concise.\n\n\
             Question: {query}"
        ),
    }
}

pub struct RetrievalPolicy<I = FlatIndex> {
    store: Arc<RwLock<Store<I>>>,
    persistence: Persistence,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    settings: RetrievalSettings,
    run_lock: Mutex<()>,
}

impl<I: SimilarityIndex> RetrievalPolicy<I> {
    pub fn new(
        store: Store<I>,
        persistence: Persistence,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store: Arc::new(RwLock::new(store)),
            persistence,
            embedder,
            generator,
            settings,
            run_lock: Mutex::new(()),
        }
    }

    /// Shared handle to the store, for read-only inspection.
    pub fn store(&self) -> &Arc<RwLock<Store<I>>> {
        &self.store
    }

    pub fn settings(&self) -> RetrievalSettings {
        self.settings
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| MemoryError::upstream("embedding task", e))?
    }

    /// Embed `query`, search, and split hits by the relevance threshold.
    ///
    /// Read-only: the store is not modified.
    pub async fn recall(&self, query: &str) -> Result<Retrieval> {
        let vector = self.embed(query).await?;

        let hits = {
            let store = self.store.read().await;
            store.search(&vector, self.settings.top_k)?
        };

        let relevant: Vec<Hit> = hits
            .iter()
            .filter(|hit| hit.similarity > self.settings.relevance_threshold)
            .cloned()
            .collect();

        for hit in &hits {
            debug!(
                "Found similar text (score: {:.2}): {}",
                hit.similarity,
                hit.record.text.chars().take(100).collect::<String>()
            );
        }

        Ok(Retrieval {
            vector,
            hits,
            relevant,
        })
    }

    /// Answer `query`, using relevant memories as context, and remember the exchange.
    pub async fn respond(&self, query: &str) -> Result<ChatOutcome> {
        self.respond_with_image(query, None).await
    }

    /// [`respond`](Self::respond), attaching a base64 encoded image to the prompt.
    ///
    /// Only the query text is embedded and remembered.
    pub async fn respond_with_image(
        &self,
        query: &str,
        image: Option<&str>,
    ) -> Result<ChatOutcome> {
        let _run = self.run_lock.lock().await;
        let retrieval = self.recall(query).await?;
        let mode = retrieval.mode();
        let used_context = matches!(mode, Mode::Augmented { .. });

        if used_context {
            info!(
                "Answering with {} relevant memories as context",
                retrieval.relevant.len()
            );
        } else {
            info!("No relevant context found, sending directly to the backend");
        }

        let prompt = build_prompt(query, &mode);
        let generation = match image {
            Some(image) => self.generator.generate_with_image(&prompt, image),
            None => self.generator.generate(&prompt),
        };
        let response = tokio::time::timeout(self.settings.generation_timeout, generation)
            .await
            .map_err(|_| {
                MemoryError::Upstream(format!(
                    "generation timed out after {:?}",
                    self.settings.generation_timeout
                ))
            })??;

        let (vector_db_size, persisted) = self
            .commit(query, &retrieval.vector, &response, used_context)
            .await?;

        Ok(ChatOutcome {
            response,
            debug: DebugInfo {
                used_context,
                similar_messages_count: retrieval.relevant.len(),
                vector_db_size,
            },
            persisted,
        })
    }

    async fn commit(
        &self,
        query: &str,
        vector: &[f32],
        response: &str,
        used_context: bool,
    ) -> Result<(usize, bool)> {
        let mut extra = Extra::new();
        extra.insert("response".into(), Value::String(response.to_string()));
        extra.insert("used_context".into(), Value::Bool(used_context));

        let mut store = self.store.write().await;
        let id = store.add(query.to_string(), vector, extra)?;

        let persisted = match self.persistence.save(&*store) {
            Ok(()) => true,
            Err(e) => {
                warn!("Memory {id} is held in memory only, save failed: {e}");
                false
            }
        };
        debug!("Added text to memory store: {query}");

        Ok((store.len(), persisted))
    }
}
