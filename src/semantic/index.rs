//! In-memory embedding column for the catalog.
//!
//! Maps product id to its image embedding and the fingerprint of the image
//! the embedding was computed from. Search is an exact cosine scan; since
//! every stored vector is unit length the score is a plain dot product.

use std::collections::HashMap;

use super::normalize::{dot, is_unit_norm, l2_norm};

/// An entry in the vector index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// Fingerprint of the image URL that was embedded
    pub image_fingerprint: u64,
    pub embedding: Vec<f32>,
}

/// Search result from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: u64,
    /// Cosine similarity in [-1.0, 1.0]
    pub score: f32,
}

#[derive(Clone)]
pub struct VectorIndex {
    entries: HashMap<u64, VectorEntry>,
    dimensions: usize,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the embedding for `id`.
    ///
    /// Rejects vectors of the wrong dimension and vectors that are not unit
    /// length, so a zero vector can never enter the index.
    pub fn insert(
        &mut self,
        id: u64,
        image_fingerprint: u64,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }
        if !is_unit_norm(&embedding) {
            return Err(IndexError::NotNormalized(l2_norm(&embedding)));
        }

        self.entries.insert(
            id,
            VectorEntry {
                image_fingerprint,
                embedding,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<VectorEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&VectorEntry> {
        self.entries.get(&id)
    }

    /// True when `id` has an embedding computed from the image identified
    /// by `image_fingerprint`.
    pub fn is_current(&self, id: u64, image_fingerprint: u64) -> bool {
        self.entries
            .get(&id)
            .map(|e| e.image_fingerprint == image_fingerprint)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Score every entry against `query`, keeping those at or above
    /// `threshold`, best first, at most `limit`.
    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if !is_unit_norm(query) {
            return Err(IndexError::NotNormalized(l2_norm(query)));
        }

        let mut results: Vec<SearchResult> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                let score = dot(query, &entry.embedding);
                (score >= threshold).then_some(SearchResult { id: *id, score })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(limit);

        Ok(results)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding is not unit length (norm {0})")]
    NotNormalized(f32),
}
