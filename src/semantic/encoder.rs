//! Encoder abstraction and the process-wide lazily-loaded instance.
//!
//! Loading weights is expensive, so a [`SharedEncoder`] constructs its
//! encoder at most once per process. Construction is single-flight:
//! concurrent first callers block on the same in-progress load instead of
//! each starting their own. A failed load leaves the cell empty so the
//! next caller retries.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::config::SearchConfig;

use super::embeddings::ClipEncoder;
use super::normalize::{is_unit_norm, l2_norm};
use super::stub::HashEncoder;

/// Error type for encoder construction and inference.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Embedding generation failed: {0}")]
    EncodingFailed(String),

    #[error("Embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding is not unit length (norm {0})")]
    NotNormalized(f32),
}

/// A joint image/text encoder producing unit-length vectors.
pub trait Encoder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn encode_image(&self, canonical: &[u8]) -> Result<Vec<f32>, EncodingError>;
    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError>;

    /// SHA256 of the model name. Stored alongside embeddings so vectors
    /// from different models are never compared.
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Model id the encoder selected by `model` will report, without loading it.
pub fn configured_model_id(model: &str) -> [u8; 32] {
    match model.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => model_id_hash(super::DEFAULT_MODEL),
        other => model_id_hash(other),
    }
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn Encoder>, EncodingError> + Send + Sync>;

/// Process-wide encoder handle, loaded on first use.
pub struct SharedEncoder {
    cell: OnceCell<Arc<dyn Encoder>>,
    loader: Loader,
    loads: AtomicUsize,
}

impl SharedEncoder {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Encoder>, EncodingError> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            loader: Box::new(loader),
            loads: AtomicUsize::new(0),
        }
    }

    /// Build the loader selected by `config.model`. Nothing is loaded yet.
    pub fn from_config(config: &SearchConfig, base_path: PathBuf) -> Self {
        let model = config.model.clone();
        let dimensions = config.embedding_dimensions;
        let timeout = Duration::from_secs(config.download_timeout_secs);

        Self::new(move || -> Result<Arc<dyn Encoder>, EncodingError> {
            if model.eq_ignore_ascii_case(HashEncoder::MODEL_NAME) {
                return Ok(Arc::new(HashEncoder::new(dimensions)));
            }
            let encoder = ClipEncoder::new(&model, base_path.clone(), Some(timeout))?;
            if encoder.dimensions() != dimensions {
                return Err(EncodingError::DimensionMismatch {
                    expected: dimensions,
                    got: encoder.dimensions(),
                });
            }
            Ok(Arc::new(encoder))
        })
    }

    /// Wrap an already-constructed encoder.
    pub fn preloaded(encoder: Arc<dyn Encoder>) -> Self {
        let shared = Self::new(|| {
            Err(EncodingError::InitFailed(
                "preloaded encoder has no loader".to_string(),
            ))
        });
        let _ = shared.cell.set(encoder);
        shared
    }

    /// Get the encoder, loading it if this is the first call.
    pub fn get(&self) -> Result<Arc<dyn Encoder>, EncodingError> {
        self.cell
            .get_or_try_init(|| {
                self.loads.fetch_add(1, Ordering::SeqCst);
                let started = Instant::now();
                let encoder = (self.loader)()?;
                log::info!(
                    "encoder '{}' ready ({} dims) in {:?}",
                    encoder.model_name(),
                    encoder.dimensions(),
                    started.elapsed()
                );
                Ok(encoder)
            })
            .cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Number of times the loader has been invoked.
    #[cfg(test)]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn encode_image(&self, canonical: &[u8]) -> Result<Vec<f32>, EncodingError> {
        let encoder = self.get()?;
        let v = encoder.encode_image(canonical)?;
        verify_embedding(&v, encoder.dimensions())?;
        Ok(v)
    }

    pub fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let encoder = self.get()?;
        let v = encoder.encode_text(text)?;
        verify_embedding(&v, encoder.dimensions())?;
        Ok(v)
    }
}

/// Reject vectors with the wrong shape or that are not unit length.
///
/// Encoders already normalize; this only verifies. Re-normalizing here
/// would hide a broken encoder.
pub fn verify_embedding(v: &[f32], dimensions: usize) -> Result<(), EncodingError> {
    if v.len() != dimensions {
        return Err(EncodingError::DimensionMismatch {
            expected: dimensions,
            got: v.len(),
        });
    }
    if !is_unit_norm(v) {
        return Err(EncodingError::NotNormalized(l2_norm(v)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    struct FixedEncoder {
        output: Vec<f32>,
    }

    impl Encoder for FixedEncoder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dimensions(&self) -> usize {
            self.output.len()
        }
        fn encode_image(&self, _: &[u8]) -> Result<Vec<f32>, EncodingError> {
            Ok(self.output.clone())
        }
        fn encode_text(&self, _: &str) -> Result<Vec<f32>, EncodingError> {
            Ok(self.output.clone())
        }
    }

    #[test]
    fn test_concurrent_first_use_loads_once() {
        let shared = Arc::new(SharedEncoder::new(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Arc::new(HashEncoder::new(16)) as Arc<dyn Encoder>)
        }));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    shared.encode_text("concurrent").unwrap()
                })
            })
            .collect();

        let outputs: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(shared.load_count(), 1);
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let shared = SharedEncoder::new({
            let attempts = attempts.clone();
            move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EncodingError::InitFailed("disk full".to_string()))
                } else {
                    Ok(Arc::new(HashEncoder::new(8)) as Arc<dyn Encoder>)
                }
            }
        });

        assert!(shared.get().is_err());
        assert!(!shared.is_ready());
        assert!(shared.get().is_ok());
        assert!(shared.is_ready());
        assert_eq!(shared.load_count(), 2);
    }

    #[test]
    fn test_non_normalized_output_rejected() {
        let shared = SharedEncoder::preloaded(Arc::new(FixedEncoder {
            output: vec![2.0, 0.0, 0.0],
        }));
        assert!(matches!(
            shared.encode_text("x"),
            Err(EncodingError::NotNormalized(_))
        ));
    }

    #[test]
    fn test_zero_vector_is_an_error() {
        let shared = SharedEncoder::preloaded(Arc::new(FixedEncoder {
            output: vec![0.0; 4],
        }));
        assert!(shared.encode_image(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_verify_embedding_dimension() {
        let result = verify_embedding(&[1.0, 0.0], 3);
        assert!(matches!(
            result,
            Err(EncodingError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_model_id_hash_is_stable() {
        assert_eq!(model_id_hash("clip-vit-b-32"), model_id_hash("clip-vit-b-32"));
        assert_ne!(model_id_hash("clip-vit-b-32"), model_id_hash("stub"));
    }

    #[test]
    fn test_configured_model_id_matches_encoder() {
        assert_eq!(configured_model_id("ClipVitB32"), model_id_hash("clip-vit-b-32"));
        assert_eq!(
            configured_model_id("STUB"),
            HashEncoder::new(4).model_id()
        );
    }
}
