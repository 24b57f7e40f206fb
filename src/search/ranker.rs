//! The hybrid ranker: turns a [`SearchQuery`] into ranked products.
//!
//! CPU-bound work (decode, resize, inference, the similarity scan) runs on
//! tokio's blocking pool. Image preprocessing plus encoding share one
//! deadline; missing it is an `EncodingTimeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::config::SearchConfig;
use crate::images::{self, PreprocessOptions};
use crate::semantic::SharedEncoder;

use super::store::{MatchedProduct, SimilarityStore};
use super::taxonomy;
use super::{
    ImageSearchMetadata, ImageSearchResponse, RankedResult, SearchError, SearchMode, SearchQuery,
    TextSearchResponse,
};

const SUGGESTION_LIMIT: usize = 8;

#[derive(Debug, Clone)]
pub struct RankerOptions {
    pub text_threshold: f32,
    pub image_threshold: f32,
    pub default_limit: usize,
    pub max_limit: usize,
    pub taxonomy_limit: usize,
    pub text_embedding: bool,
    pub encode_timeout: Duration,
    pub preprocess: PreprocessOptions,
}

impl From<&SearchConfig> for RankerOptions {
    fn from(config: &SearchConfig) -> Self {
        Self {
            text_threshold: config.text_threshold,
            image_threshold: config.image_threshold,
            default_limit: config.default_limit,
            max_limit: config.max_limit,
            taxonomy_limit: config.taxonomy_limit,
            text_embedding: config.text_embedding,
            encode_timeout: Duration::from_secs(config.encode_timeout_secs),
            preprocess: PreprocessOptions::from(config),
        }
    }
}

impl RankerOptions {
    pub fn threshold_for(&self, mode: SearchMode) -> f32 {
        match mode {
            SearchMode::Text => self.text_threshold,
            SearchMode::Image => self.image_threshold,
        }
    }

    /// Requested limit, defaulted and clamped to `[1, max_limit]`.
    pub fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

pub struct HybridRanker {
    encoder: Arc<SharedEncoder>,
    store: Arc<dyn SimilarityStore>,
    catalog: Arc<dyn Catalog>,
    options: RankerOptions,
    warming: Arc<AtomicBool>,
}

/// Drop anything under `threshold` and restore descending order. A store
/// that already honours both leaves the list untouched.
pub fn enforce_ranking(mut results: Vec<RankedResult>, threshold: f32) -> Vec<RankedResult> {
    let before = results.len();
    results.retain(|r| r.relevance_score.is_finite() && r.relevance_score >= threshold);
    let sorted = results
        .windows(2)
        .all(|w| w[0].relevance_score >= w[1].relevance_score);

    let dropped = before - results.len();
    if dropped > 0 {
        log::error!("similarity store returned {dropped} rows under threshold {threshold}");
    }
    if !sorted {
        log::error!("similarity store returned rows out of order");
        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    results
}

fn to_ranked(matched: Vec<MatchedProduct>) -> Vec<RankedResult> {
    matched
        .into_iter()
        .map(|m| RankedResult {
            product: m.product.summary(),
            relevance_score: m.relevance_score,
        })
        .collect()
}

impl HybridRanker {
    pub fn new(
        encoder: Arc<SharedEncoder>,
        store: Arc<dyn SimilarityStore>,
        catalog: Arc<dyn Catalog>,
        options: RankerOptions,
    ) -> Self {
        Self {
            encoder,
            store,
            catalog,
            options,
            warming: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn options(&self) -> &RankerOptions {
        &self.options
    }

    pub fn encoder(&self) -> &SharedEncoder {
        &self.encoder
    }

    pub fn indexed(&self) -> usize {
        self.store.indexed()
    }

    /// Run `f` on the blocking pool under the encode deadline.
    async fn encode_blocking<T, F>(&self, f: F) -> Result<T, SearchError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, SearchError> + Send + 'static,
    {
        match tokio::time::timeout(self.options.encode_timeout, tokio::task::spawn_blocking(f)).await
        {
            Err(_) => {
                log::warn!("encoding exceeded {:?}", self.options.encode_timeout);
                Err(SearchError::EncodingTimeout)
            }
            Ok(Err(join_err)) => {
                log::error!("encoding task failed: {join_err}");
                Err(SearchError::EncodingFailed)
            }
            Ok(Ok(result)) => result,
        }
    }

    async fn lookup(
        &self,
        embedding: Option<Vec<f32>>,
        text: Option<String>,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<RankedResult>, SearchError> {
        let store = self.store.clone();
        let matched = tokio::task::spawn_blocking(move || {
            store.match_products(embedding.as_deref(), text.as_deref(), threshold, limit)
        })
        .await
        .map_err(|err| {
            log::error!("similarity lookup task failed: {err}");
            SearchError::IndexUnavailable
        })??;

        let mut results = enforce_ranking(to_ranked(matched), threshold);
        results.truncate(limit);
        Ok(results)
    }

    /// Load the encoder on the blocking pool without waiting for it. At most
    /// one load is in flight.
    fn warm_encoder(&self) {
        if self.warming.swap(true, Ordering::SeqCst) {
            return;
        }
        let encoder = self.encoder.clone();
        let warming = self.warming.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = encoder.get() {
                log::warn!("background encoder load failed: {err}");
            }
            warming.store(false, Ordering::SeqCst);
        });
    }

    /// Optional text signal. Text search never waits for the encoder to
    /// load; until it is ready queries are scored lexically.
    async fn text_embedding(&self, text: &str) -> Option<Vec<f32>> {
        if !self.options.text_embedding {
            return None;
        }
        if !self.encoder.is_ready() {
            log::debug!("encoder not loaded yet, text search is lexical only");
            self.warm_encoder();
            return None;
        }
        let encoder = self.encoder.clone();
        let text = text.to_string();
        match self
            .encode_blocking(move || Ok(encoder.encode_text(&text)?))
            .await
        {
            Ok(v) => Some(v),
            Err(err) => {
                log::warn!("text embedding unavailable, using lexical signal only: {err}");
                None
            }
        }
    }

    /// Preprocess and encode an uploaded image.
    pub async fn encode_upload(
        &self,
        bytes: Vec<u8>,
        declared_mime: Option<String>,
    ) -> Result<Vec<f32>, SearchError> {
        let opts = self.options.preprocess.clone();
        // oversized uploads never reach the blocking pool
        if bytes.len() > opts.max_size_bytes {
            return Err(images::PreprocessError::TooLarge {
                size: bytes.len(),
                limit: opts.max_size_bytes,
            }
            .into());
        }

        let encoder = self.encoder.clone();
        self.encode_blocking(move || {
            let canonical = images::preprocess(&bytes, declared_mime.as_deref(), &opts)?;
            log::debug!(
                "canonical {} {:?} -> {:?}, {} bytes",
                images::CANONICAL_MIME,
                canonical.original_dimensions,
                canonical.dimensions,
                canonical.data.len()
            );
            Ok(encoder.encode_image(&canonical.data)?)
        })
        .await
    }

    /// Rank products for `query`. `threshold` and `limit` fall back to the
    /// configured per-mode defaults.
    pub async fn rank(
        &self,
        query: SearchQuery,
        threshold: Option<f32>,
        limit: Option<usize>,
    ) -> Result<Vec<RankedResult>, SearchError> {
        let threshold = match threshold {
            Some(t) if !(0.0..=1.0).contains(&t) => {
                return Err(SearchError::InvalidInput(
                    "Threshold must be between 0 and 1.".to_string(),
                ))
            }
            Some(t) => t,
            None => self.options.threshold_for(query.mode()),
        };
        let limit = self.options.clamp_limit(limit);

        match query {
            SearchQuery::Text { text } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return Err(SearchError::InvalidInput(
                        "Please enter a search term.".to_string(),
                    ));
                }
                let embedding = self.text_embedding(&text).await;
                self.lookup(embedding, Some(text), threshold, limit).await
            }
            SearchQuery::Image {
                bytes,
                declared_mime,
            } => {
                let embedding = self.encode_upload(bytes, declared_mime).await?;
                self.lookup(Some(embedding), None, threshold, limit).await
            }
        }
    }

    /// Text search plus taxonomy matches and suggestions.
    pub async fn search_text(
        &self,
        q: &str,
        limit: Option<usize>,
        taxonomy_limit: Option<usize>,
    ) -> Result<TextSearchResponse, SearchError> {
        let products = self
            .rank(
                SearchQuery::Text {
                    text: q.to_string(),
                },
                None,
                limit,
            )
            .await?;

        let taxonomy_limit = taxonomy_limit
            .unwrap_or(self.options.taxonomy_limit)
            .min(self.options.max_limit);
        let catalog = self.catalog.clone();
        let (categories, collections) =
            tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                Ok((catalog.categories()?, catalog.collections()?))
            })
            .await
            .map_err(|err| {
                log::error!("taxonomy task failed: {err}");
                SearchError::IndexUnavailable
            })?
            .map_err(|err| {
                log::error!("taxonomy lookup failed: {err:#}");
                SearchError::IndexUnavailable
            })?;

        let categories = taxonomy::match_taxonomy(q, &categories, taxonomy_limit);
        let collections = taxonomy::match_taxonomy(q, &collections, taxonomy_limit);
        let suggestions = taxonomy::suggestions(
            q,
            categories
                .iter()
                .chain(collections.iter())
                .map(|t| t.name.as_str())
                .chain(products.iter().map(|p| p.product.title.as_str())),
            SUGGESTION_LIMIT,
        );

        Ok(TextSearchResponse {
            products,
            categories,
            collections,
            suggestions,
        })
    }

    /// Image search. Products only; no taxonomy.
    pub async fn search_image(
        &self,
        bytes: Vec<u8>,
        declared_mime: Option<String>,
        limit: Option<usize>,
    ) -> Result<ImageSearchResponse, SearchError> {
        let threshold = self.options.image_threshold;
        let limit = self.options.clamp_limit(limit);

        let embedding = self.encode_upload(bytes, declared_mime).await?;
        let dimensions = embedding.len();
        let products = self.lookup(Some(embedding), None, threshold, limit).await?;

        Ok(ImageSearchResponse {
            metadata: ImageSearchMetadata {
                total: products.len(),
                threshold,
                embedding_dimensions: dimensions,
            },
            products,
        })
    }
}
