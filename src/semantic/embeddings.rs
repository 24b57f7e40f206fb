//! CLIP encoder pair backed by fastembed.
//!
//! Provides a high-level interface over the two towers of a joint
//! image/text embedding model:
//! - Model download with configurable cache directory on first construction
//! - Vision tower for canonical product photos
//! - Text tower projecting queries into the same 512-d space
//!
//! Both towers return vectors normalized to unit length.

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::encoder::{Encoder, EncodingError};
use super::normalize::l2_normalize_in_place;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Wrapper around fastembed's image and text CLIP models.
/// Uses a Mutex per tower because fastembed's embed calls require &mut self.
pub struct ClipEncoder {
    vision: Mutex<ImageEmbedding>,
    text: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipEncoder {
    /// Load both towers for `model_name`.
    ///
    /// Weights are downloaded into `cache_dir/models` on first use. This is
    /// slow and must only be called through the process-wide
    /// [`SharedEncoder`](super::SharedEncoder).
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EncodingError> {
        let (image_model, text_model) = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
        let started = Instant::now();

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EncodingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let vision = ImageEmbedding::try_new(
            ImageInitOptions::new(image_model)
                .with_cache_dir(models_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(|e| EncodingError::InitFailed(format!("vision tower: {}", e)))?;

        let mut text = TextEmbedding::try_new(
            InitOptions::new(text_model)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EncodingError::InitFailed(format!("text tower: {}", e)))?;

        let dimensions = Self::probe_dimensions(&mut text)?;

        // fastembed has no download deadline of its own
        if started.elapsed() > timeout {
            log::warn!(
                "loading {model_name} took {:?}, over the {timeout:?} download budget",
                started.elapsed()
            );
        }

        Ok(Self {
            vision: Mutex::new(vision),
            text: Mutex::new(text),
            model_name: super::DEFAULT_MODEL.to_string(),
            dimensions,
        })
    }

    fn parse_model_name(
        name: &str,
    ) -> Result<(ImageEmbeddingModel, fastembed::EmbeddingModel), EncodingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok((
                ImageEmbeddingModel::ClipVitB32,
                fastembed::EmbeddingModel::ClipVitB32,
            )),
            _ => Err(EncodingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32, stub",
                name
            ))),
        }
    }

    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EncodingError> {
        let probe = model
            .embed(vec!["probe"], None)
            .map_err(|e| EncodingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EncodingError::InitFailed("Model returned no embedding".to_string()))
    }

    fn finish(raw: Option<Vec<f32>>) -> Result<Vec<f32>, EncodingError> {
        let mut v = raw
            .ok_or_else(|| EncodingError::EncodingFailed("No embedding returned".to_string()))?;
        if !l2_normalize_in_place(&mut v) {
            return Err(EncodingError::EncodingFailed(
                "model produced a zero or non-finite vector".to_string(),
            ));
        }
        Ok(v)
    }
}

impl Encoder for ClipEncoder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode_image(&self, canonical: &[u8]) -> Result<Vec<f32>, EncodingError> {
        let mut model = self.vision.lock().map_err(|e| {
            EncodingError::EncodingFailed(format!("Failed to acquire vision lock: {}", e))
        })?;

        let embeddings = model
            .embed_bytes(&[canonical], None)
            .map_err(|e| EncodingError::EncodingFailed(e.to_string()))?;

        Self::finish(embeddings.into_iter().next())
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let mut model = self.text.lock().map_err(|e| {
            EncodingError::EncodingFailed(format!("Failed to acquire text lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EncodingError::EncodingFailed(e.to_string()))?;

        Self::finish(embeddings.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::normalize::is_unit_norm;

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = ClipEncoder::new("nonexistent-model", temp_dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EncodingError::InvalidModel(_))));
    }

    #[test]
    fn test_finish_rejects_zero_vector() {
        let result = ClipEncoder::finish(Some(vec![0.0; 512]));
        assert!(matches!(result, Err(EncodingError::EncodingFailed(_))));
    }

    #[test]
    fn test_finish_rejects_missing_output() {
        assert!(matches!(
            ClipEncoder::finish(None),
            Err(EncodingError::EncodingFailed(_))
        ));
    }

    // Requires model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_clip_towers_share_space() {
        let temp_dir = tempfile::tempdir().unwrap();
        let encoder = ClipEncoder::new("clip-vit-b-32", temp_dir.path().to_path_buf(), None).unwrap();
        assert_eq!(encoder.dimensions(), 512);

        let text = encoder.encode_text("a red toy car").unwrap();
        assert_eq!(text.len(), 512);
        assert!(is_unit_norm(&text));

        let img = image::RgbImage::from_pixel(64, 64, image::Rgb([200, 20, 20]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();

        let vision = encoder.encode_image(buf.get_ref()).unwrap();
        assert_eq!(vision.len(), 512);
        assert!(is_unit_norm(&vision));
    }
}
