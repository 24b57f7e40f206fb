//! Embedding infrastructure for product search.
//!
//! # Architecture
//!
//! - `encoder`: `Encoder` trait and the lazily-loaded process-wide instance
//! - `embeddings`: fastembed CLIP vision + text towers
//! - `stub`: deterministic offline encoder
//! - `normalize`: unit-vector math
//! - `index`: in-memory embedding column with cosine search
//! - `storage`: binary file I/O for vectors.bin persistence
//! - `store`: index + file, persisted on every write

mod embeddings;
pub mod encoder;
mod index;
pub mod normalize;
mod storage;
mod store;
mod stub;

pub use encoder::{configured_model_id, Encoder, EncodingError, SharedEncoder};
pub use store::{EmbeddingStore, EmbeddingStoreError};
pub use stub::HashEncoder;

/// Default encoder: CLIP ViT-B/32, 512-d joint image/text space.
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";

pub const EMBEDDING_DIMENSIONS: usize = 512;
