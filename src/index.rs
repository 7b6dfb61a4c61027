//! # Similarity index
//!
//! Exact nearest-neighbour search over embedding vectors.
//!
//! The store only talks to the [`SimilarityIndex`] trait, so a graph or tree based
//! index can replace [`FlatIndex`] without touching the record store, persistence,
//! or the retrieval policy. [`FlatIndex`] itself is a linear scan over one
//! contiguous `f32` buffer, which is plenty for a few thousand memories.
//!
//! ## Distances and similarity
//! Distances are **squared** Euclidean. The retrieval policy compares
//! [`similarity`] (`1 / (1 + d)`) against its relevance threshold, never the raw
//! distance.
//!
//! ```rust
//! use chat_recall::index::{FlatIndex, SimilarityIndex};
//!
//! let mut index = FlatIndex::with_dimension(2);
//! index.add(&[0.0, 0.0]).unwrap();
//! index.add(&[3.0, 4.0]).unwrap();
//!
//! let hits = index.search(&[0.0, 1.0], 5).unwrap();
//! assert_eq!(hits[0].id, 0);
//! assert_eq!(hits[0].distance, 1.0);
//! assert_eq!(hits[0].similarity(), 0.5);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Convert a squared Euclidean distance into a similarity score in `(0, 1]`.
///
/// Distance `0` maps to `1.0`; the score decreases strictly as distance grows.
pub fn similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// One search hit: the vector's ID and its squared distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: usize,
    pub distance: f32,
}

impl Neighbor {
    pub fn similarity(&self) -> f32 {
        similarity(self.distance)
    }
}

/// The contract the store relies on.
///
/// IDs are positions: the first vector added is `0`, the next `1`, and so on.
/// Implementations must reject vectors whose length differs from
/// [`dimension`](SimilarityIndex::dimension) before mutating anything.
pub trait SimilarityIndex: Send + Sync {
    /// Create an empty index for vectors of `dimension` floats.
    fn with_dimension(dimension: usize) -> Self
    where
        Self: Sized;

    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a vector and return its ID.
    fn add(&mut self, vector: &[f32]) -> Result<usize>;

    /// Return up to `k` nearest vectors, closest first, ties going to the lower ID.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Opaque serialized form, readable only by [`from_bytes`](SimilarityIndex::from_bytes)
    /// of the same implementation.
    fn to_bytes(&self) -> Result<Vec<u8>>;

    fn from_bytes(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Brute-force index storing every vector back to back in a single buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<f32>,
}

impl FlatIndex {
    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Iterate over stored vectors in ID order.
    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.vectors.chunks_exact(self.dimension)
    }
}

impl SimilarityIndex for FlatIndex {
    /// # Panics
    /// Panics if `dimension` is zero.
    fn with_dimension(dimension: usize) -> Self {
        assert!(dimension > 0, "index dimension must be non-zero");
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.vectors.len() / self.dimension
    }

    fn add(&mut self, vector: &[f32]) -> Result<usize> {
        self.check_dimension(vector)?;
        let id = self.len();
        self.vectors.extend_from_slice(vector);
        Ok(id)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.check_dimension(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Neighbor> = self
            .vectors()
            .enumerate()
            .map(|(id, stored)| Neighbor {
                id,
                distance: squared_euclidean(query, stored),
            })
            .collect();

        // Stable order on equal distances keeps the earliest insertion first.
        scored.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);

        Ok(scored)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| MemoryError::persistence("encoding flat index", e))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (index, _read): (FlatIndex, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| MemoryError::persistence("decoding flat index", e))?;

        if index.dimension == 0 || index.vectors.len() % index.dimension != 0 {
            return Err(MemoryError::Persistence(format!(
                "flat index buffer of {} floats does not divide into vectors of {}",
                index.vectors.len(),
                index.dimension
            )));
        }

        Ok(index)
    }
}

fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
