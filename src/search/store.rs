//! Similarity lookup: query embedding and/or text in, ranked products out.
//!
//! This is the seam a database-backed vector search would plug into. The
//! local implementation scans the catalog for text matches and does an
//! exact cosine scan over the embedding store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{image_fingerprint, Catalog, Product};
use crate::semantic::{EmbeddingStore, EmbeddingStoreError};

use super::hybrid::{self, Signal, Weights};
use super::lexical;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("catalog unavailable: {0:#}")]
    Catalog(anyhow::Error),

    #[error("embedding lookup failed: {0}")]
    Embeddings(#[from] EmbeddingStoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedProduct {
    pub product: Product,
    pub signal: Signal,
    pub relevance_score: f32,
}

pub trait SimilarityStore: Send + Sync {
    /// Products matching either signal with `relevance_score >= threshold`,
    /// best first, at most `limit`.
    fn match_products(
        &self,
        query_embedding: Option<&[f32]>,
        text: Option<&str>,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<MatchedProduct>, StoreError>;

    /// Number of products that currently have an embedding.
    fn indexed(&self) -> usize;
}

pub struct LocalSimilarityStore {
    catalog: Arc<dyn Catalog>,
    embeddings: Arc<EmbeddingStore>,
    weights: Weights,
}

impl LocalSimilarityStore {
    pub fn new(catalog: Arc<dyn Catalog>, embeddings: Arc<EmbeddingStore>, weights: Weights) -> Self {
        Self {
            catalog,
            embeddings,
            weights,
        }
    }

    /// Cosine similarities of products whose stored embedding still belongs
    /// to their current primary image.
    fn image_signals(
        &self,
        query: &[f32],
        threshold: f32,
        products: &HashMap<u64, &Product>,
    ) -> Result<Vec<(u64, f32)>, StoreError> {
        let hits = self.embeddings.search(query, threshold, usize::MAX)?;
        Ok(hits
            .into_iter()
            .filter(|hit| {
                products
                    .get(&hit.id)
                    .and_then(|p| p.primary_image())
                    .is_some_and(|url| self.embeddings.is_current(hit.id, image_fingerprint(url)))
            })
            .map(|hit| (hit.id, hit.score.clamp(0.0, 1.0)))
            .collect())
    }
}

impl SimilarityStore for LocalSimilarityStore {
    fn match_products(
        &self,
        query_embedding: Option<&[f32]>,
        text: Option<&str>,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<MatchedProduct>, StoreError> {
        let products = self.catalog.products().map_err(StoreError::Catalog)?;
        let by_id: HashMap<u64, &Product> = products.iter().map(|p| (p.id, p)).collect();

        let text_signals = match text.map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => lexical::score_products(text, &products),
            None => vec![],
        };
        let image_signals = match query_embedding {
            Some(query) => self.image_signals(query, threshold, &by_id)?,
            None => vec![],
        };

        let scored = hybrid::combine(
            &text_signals,
            &image_signals,
            self.weights,
            threshold,
            limit,
        );

        Ok(scored
            .into_iter()
            .filter_map(|s| {
                by_id.get(&s.id).map(|p| MatchedProduct {
                    product: (*p).clone(),
                    signal: s.signal,
                    relevance_score: s.score,
                })
            })
            .collect())
    }

    fn indexed(&self) -> usize {
        self.embeddings.len()
    }
}
