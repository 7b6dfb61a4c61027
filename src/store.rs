//! # Store
//!
//! The aggregate that owns the similarity index and the record store and keeps
//! them in lock-step: vector `i` and record `i` are always added together, so
//! `index.len() == records.len()` after every completed call.
//!
//! A `Store` is built once by the composition root ([`Store::open`]) and then
//! shared with the retrieval policy; nothing else mutates it.
//!
//! ```rust
//! use chat_recall::records::Extra;
//! use chat_recall::store::Store;
//!
//! let mut store: Store = Store::new(2);
//! store.add("hello".into(), &[1.0, 0.0], Extra::new()).unwrap();
//! let hits = store.search(&[1.0, 0.0], 3).unwrap();
//! assert_eq!(hits[0].record.text, "hello");
//! assert_eq!(hits[0].similarity, 1.0);
//! ```

use tracing::{error, info, warn};

use crate::error::{MemoryError, Result};
use crate::index::{FlatIndex, SimilarityIndex};
use crate::persistence::Persistence;
use crate::records::{Extra, Record, RecordStore};

/// A search hit resolved to its record.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
    /// `1 / (1 + distance)`.
    pub similarity: f32,
    pub record: Record,
}

/// How [`Store::open`] arrived at the store it returned.
#[derive(Debug)]
pub enum Origin {
    /// Restored from an existing artifact.
    Loaded,
    /// No artifact existed; an empty store was created and saved (if `persisted`).
    Created { persisted: bool },
    /// The artifact could not be read; starting empty.
    Recovered(MemoryError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Store<I = FlatIndex> {
    index: I,
    records: RecordStore,
}

impl<I: SimilarityIndex> Store<I> {
    /// Empty store for vectors of `dimension` floats.
    pub fn new(dimension: usize) -> Self {
        Self {
            index: I::with_dimension(dimension),
            records: RecordStore::new(),
        }
    }

    pub(crate) fn from_parts(index: I, records: RecordStore) -> Result<Self> {
        if index.len() != records.len() {
            return Err(MemoryError::Persistence(format!(
                "index holds {} vectors but there are {} records",
                index.len(),
                records.len()
            )));
        }
        Ok(Self { index, records })
    }

    /// Load the store behind `persistence`, or start a fresh one.
    ///
    /// - Artifact present and valid → [`Origin::Loaded`].
    /// - No artifact → empty store, saved right away → [`Origin::Created`].
    /// - Artifact unreadable → empty store, artifact left on disk → [`Origin::Recovered`].
    ///
    /// None of these is fatal; losing memory only degrades future answers.
    pub fn open(persistence: &Persistence, dimension: usize) -> (Self, Origin) {
        match persistence.load::<I>(dimension) {
            Ok(Some(store)) => {
                info!(
                    "Loaded {} memories from {}",
                    store.len(),
                    persistence.path().display()
                );
                (store, Origin::Loaded)
            }
            Ok(None) => {
                let store = Self::new(dimension);
                let persisted = match persistence.save(&store) {
                    Ok(()) => {
                        info!(
                            "Created new memory store at {}",
                            persistence.path().display()
                        );
                        true
                    }
                    Err(e) => {
                        warn!("New memory store could not be persisted: {e}");
                        false
                    }
                };
                (store, Origin::Created { persisted })
            }
            Err(e) => {
                error!(
                    "Could not load memory store from {}: {e}; starting empty",
                    persistence.path().display()
                );
                (Self::new(dimension), Origin::Recovered(e))
            }
        }
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append `text` with its embedding and payload; returns the shared ID.
    ///
    /// A dimension mismatch is rejected before either side is touched.
    pub fn add(&mut self, text: String, vector: &[f32], extra: Extra) -> Result<usize> {
        let id = self.index.add(vector)?;
        let record_id = self.records.append(text, extra);
        debug_assert_eq!(id, record_id, "index and records out of step");
        Ok(id)
    }

    /// The `k` nearest records to `vector`, closest first.
    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<Hit>> {
        self.index
            .search(vector, k)?
            .into_iter()
            .map(|neighbor| {
                Ok(Hit {
                    id: neighbor.id,
                    distance: neighbor.distance,
                    similarity: neighbor.similarity(),
                    record: self.records.get(neighbor.id)?.clone(),
                })
            })
            .collect()
    }

    pub fn record(&self, id: usize) -> Result<&Record> {
        self.records.get(id)
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn index(&self) -> &I {
        &self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn extra_with_response(response: &str) -> Extra {
        json!({ "response": response }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_sizes_stay_in_step_across_adds() {
        let mut store: Store = Store::new(3);
        let vectors = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        for (i, v) in vectors.iter().enumerate() {
            let id = store.add(format!("memory {i}"), v, Extra::new()).unwrap();
            assert_eq!(id, i);
            assert_eq!(store.index().len(), store.records().len());
        }

        assert!(store.add("bad".into(), &[1.0], Extra::new()).is_err());
        assert_eq!(store.index().len(), 3);
        assert_eq!(store.records().len(), 3);
    }

    #[test]
    fn test_search_resolves_records_and_scores() {
        let mut store: Store = Store::new(2);
        store
            .add("far".into(), &[5.0, 5.0], extra_with_response("no"))
            .unwrap();
        store
            .add("near".into(), &[1.0, 0.0], extra_with_response("yes"))
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
        assert_eq!(hits[0].record.text, "near");
        assert_eq!(hits[0].record.response(), Some("yes"));
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[0].similarity, 1.0);
    }

    #[test]
    fn test_search_on_empty_store() {
        let store: Store = Store::new(2);
        assert!(store.search(&[0.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn test_open_creates_and_persists_when_missing() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("data").join("vector_db.bin"));

        let (store, origin) = Store::<FlatIndex>::open(&persistence, 4);
        assert!(store.is_empty());
        assert!(matches!(origin, Origin::Created { persisted: true }));
        assert!(persistence.path().exists());
    }

    #[test]
    fn test_open_loads_existing_artifact() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));

        let mut store: Store = Store::new(2);
        store.add("kept".into(), &[0.5, 0.5], Extra::new()).unwrap();
        persistence.save(&store).unwrap();

        let (reopened, origin) = Store::<FlatIndex>::open(&persistence, 2);
        assert!(matches!(origin, Origin::Loaded));
        assert_eq!(reopened, store);
    }

    #[test]
    fn test_open_recovers_from_corrupt_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vector_db.bin");
        std::fs::write(&path, b"definitely not a memory store").unwrap();
        let persistence = Persistence::new(path.clone());

        let (store, origin) = Store::<FlatIndex>::open(&persistence, 2);
        assert!(store.is_empty());
        assert!(matches!(
            origin,
            Origin::Recovered(MemoryError::Persistence(_))
        ));
        // The unreadable file is left for the operator.
        assert_eq!(std::fs::read(&path).unwrap(), b"definitely not a memory store");
    }
}
