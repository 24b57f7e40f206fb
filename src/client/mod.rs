//! Client-side query orchestration for interactive search.
//!
//! - `cache`: bounded LRU of results keyed by normalized query
//! - `transport`: how requests reach the search server
//! - `orchestrator`: debounce, sequencing, cancellation, retries

pub mod cache;
pub mod orchestrator;
pub mod transport;

use crate::catalog::TaxonomyEntry;
use crate::search::{ImageSearchResponse, RankedResult, SearchError, TextSearchResponse};

pub use orchestrator::{OrchestratorOptions, QueryOrchestrator, SearchState, Status};
pub use transport::{HttpTransport, SearchTransport};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Search(err) => err.is_transient(),
            ClientError::Network(_) => true,
            ClientError::Decode(_) => false,
        }
    }
}

/// What the UI renders: products plus, for text searches, taxonomy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub products: Vec<RankedResult>,
    pub categories: Vec<TaxonomyEntry>,
    pub collections: Vec<TaxonomyEntry>,
    pub suggestions: Vec<String>,
}

impl From<TextSearchResponse> for SearchResults {
    fn from(r: TextSearchResponse) -> Self {
        Self {
            products: r.products,
            categories: r.categories,
            collections: r.collections,
            suggestions: r.suggestions,
        }
    }
}

impl From<ImageSearchResponse> for SearchResults {
    fn from(r: ImageSearchResponse) -> Self {
        Self {
            products: r.products,
            ..Default::default()
        }
    }
}
