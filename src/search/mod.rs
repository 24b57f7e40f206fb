//! Hybrid product search.
//!
//! # Architecture
//!
//! - `lexical`: text relevance (term rank, trigrams, prefix bonus)
//! - `hybrid`: per-product signal join and weighting
//! - `taxonomy`: category/collection matches and suggestions
//! - `store`: the similarity lookup the ranker composes against
//! - `ranker`: encode, look up, enforce result invariants

pub mod hybrid;
pub mod lexical;
mod ranker;
mod store;
pub mod taxonomy;

use serde::{Deserialize, Serialize};

use crate::catalog::{ProductSummary, TaxonomyEntry};
use crate::images::PreprocessError;
use crate::semantic::EncodingError;

pub use ranker::{HybridRanker, RankerOptions};
pub use store::{LocalSimilarityStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Text,
    Image,
}

/// One search request. A query is either text or an image, never both.
#[derive(Debug, Clone)]
pub enum SearchQuery {
    Text {
        text: String,
    },
    Image {
        bytes: Vec<u8>,
        declared_mime: Option<String>,
    },
}

impl SearchQuery {
    pub fn mode(&self) -> SearchMode {
        match self {
            SearchQuery::Text { .. } => SearchMode::Text,
            SearchQuery::Image { .. } => SearchMode::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResult {
    #[serde(flatten)]
    pub product: ProductSummary,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextSearchResponse {
    pub products: Vec<RankedResult>,
    pub categories: Vec<TaxonomyEntry>,
    pub collections: Vec<TaxonomyEntry>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSearchMetadata {
    pub total: usize,
    pub threshold: f32,
    pub embedding_dimensions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSearchResponse {
    pub products: Vec<RankedResult>,
    pub metadata: ImageSearchMetadata,
}

/// Failures a search request can surface to the caller. Messages are
/// user-facing; internal detail is logged where the error is mapped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SearchError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Unsupported image format. Please upload a JPEG, PNG or WebP image.")]
    UnsupportedFormat(String),

    #[error("The image appears to be corrupted. Please try a different image.")]
    CorruptImage,

    #[error("We couldn't process that image right now. Please try again.")]
    EncodingFailed,

    #[error("Search is taking too long right now. Please try again.")]
    EncodingTimeout,

    #[error("Search is temporarily unavailable.")]
    IndexUnavailable,
}

impl SearchError {
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::InvalidInput(_) => "invalid_input",
            SearchError::UnsupportedFormat(_) => "unsupported_format",
            SearchError::CorruptImage => "corrupt_image",
            SearchError::EncodingFailed => "encoding_failed",
            SearchError::EncodingTimeout => "encoding_timeout",
            SearchError::IndexUnavailable => "index_unavailable",
        }
    }

    /// Rebuild an error from the `code`/`error` pair of an HTTP error body.
    pub fn from_code(code: &str, message: &str) -> Option<Self> {
        Some(match code {
            "invalid_input" => SearchError::InvalidInput(message.to_string()),
            "unsupported_format" => SearchError::UnsupportedFormat(message.to_string()),
            "corrupt_image" => SearchError::CorruptImage,
            "encoding_failed" => SearchError::EncodingFailed,
            "encoding_timeout" => SearchError::EncodingTimeout,
            "index_unavailable" => SearchError::IndexUnavailable,
            _ => return None,
        })
    }

    /// Infra hiccups worth retrying; everything else needs different input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SearchError::EncodingFailed
                | SearchError::EncodingTimeout
                | SearchError::IndexUnavailable
        )
    }
}

impl From<PreprocessError> for SearchError {
    fn from(err: PreprocessError) -> Self {
        log::debug!("rejected upload: {err}");
        match err {
            PreprocessError::Empty => SearchError::InvalidInput("Image is empty.".to_string()),
            PreprocessError::TooLarge { limit, .. } => SearchError::InvalidInput(format!(
                "Image is too large. The limit is {} MB.",
                limit / (1024 * 1024)
            )),
            PreprocessError::UnsupportedFormat(mime) => SearchError::UnsupportedFormat(mime),
            PreprocessError::CorruptImage(_) => SearchError::CorruptImage,
            PreprocessError::Encode(_) => SearchError::EncodingFailed,
        }
    }
}

impl From<EncodingError> for SearchError {
    fn from(err: EncodingError) -> Self {
        log::error!("encoding failed: {err}");
        SearchError::EncodingFailed
    }
}

impl From<StoreError> for SearchError {
    fn from(err: StoreError) -> Self {
        log::error!("similarity lookup failed: {err}");
        SearchError::IndexUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for err in [
            SearchError::InvalidInput("Missing query.".to_string()),
            SearchError::CorruptImage,
            SearchError::EncodingFailed,
            SearchError::EncodingTimeout,
            SearchError::IndexUnavailable,
        ] {
            let rebuilt = SearchError::from_code(err.code(), &err.to_string()).unwrap();
            assert_eq!(rebuilt, err);
        }
        assert!(SearchError::from_code("teapot", "").is_none());
    }

    #[test]
    fn test_transient() {
        assert!(SearchError::EncodingTimeout.is_transient());
        assert!(!SearchError::CorruptImage.is_transient());
        assert!(!SearchError::InvalidInput(String::new()).is_transient());
    }

    #[test]
    fn test_preprocess_errors_map_to_user_messages() {
        let err: SearchError = PreprocessError::TooLarge {
            size: 15 * 1024 * 1024,
            limit: 10 * 1024 * 1024,
        }
        .into();
        assert_eq!(
            err,
            SearchError::InvalidInput("Image is too large. The limit is 10 MB.".to_string())
        );

        let err: SearchError = PreprocessError::CorruptImage("bad huffman".to_string()).into();
        assert!(!err.to_string().contains("huffman"));
    }

    #[test]
    fn test_ranked_result_wire_shape() {
        let result = RankedResult {
            product: ProductSummary {
                id: 3,
                title: "Robot".to_string(),
                handle: "robot".to_string(),
                thumbnail: None,
                price: 4.5,
                currency: "EUR".to_string(),
            },
            relevance_score: 0.5,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["relevanceScore"], 0.5);
        assert_eq!(json["title"], "Robot");
    }
}
