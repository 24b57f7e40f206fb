//! Result cache keyed by `(mode, normalized query, limit)`.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::search::SearchMode;

use super::SearchResults;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub mode: SearchMode,
    pub query: String,
    pub limit: usize,
}

/// Trim, collapse inner whitespace, lowercase.
pub fn normalize_query(q: &str) -> String {
    q.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl CacheKey {
    pub fn text(q: &str, limit: usize) -> Self {
        Self {
            mode: SearchMode::Text,
            query: normalize_query(q),
            limit,
        }
    }

    /// Images are keyed by a SHA-256 of their bytes.
    pub fn image(bytes: &[u8], limit: usize) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(bytes);
        Self {
            mode: SearchMode::Image,
            query: digest.iter().map(|b| format!("{b:02x}")).collect(),
            limit,
        }
    }
}

pub struct ResultCache {
    entries: LruCache<CacheKey, SearchResults>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<SearchResults> {
        self.entries.get(key).cloned()
    }

    pub fn put(&mut self, key: CacheKey, results: SearchResults) {
        self.entries.put(key, results);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
