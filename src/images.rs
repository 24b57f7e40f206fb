//! Upload normalization ahead of encoding.
//!
//! Rejects oversized and non allow-listed uploads before any decode work,
//! then decodes, shrinks to fit a bounding box (never upscaling) and
//! re-encodes as JPEG at a fixed quality. Re-encoding also drops EXIF and
//! any other metadata the encoder's own decoder could trip over.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};

use crate::config::SearchConfig;

/// Hard ceiling for uploads (10 MiB).
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

pub const DEFAULT_ALLOWED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// MIME type of every canonical image.
pub const CANONICAL_MIME: &str = "image/jpeg";

/// Largest side the decoder will accept; guards against decompression bombs.
const MAX_DECODE_SIDE: u32 = 16_384;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("image is empty")]
    Empty,

    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("image appears corrupted: {0}")]
    CorruptImage(String),

    #[error("failed to encode canonical image: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub max_size_bytes: usize,
    pub allowed_mime_types: Vec<String>,
    /// Bounding box side; larger images are scaled down to fit
    pub max_dimension: u32,
    /// JPEG quality (1-100)
    pub quality: u8,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: MAX_UPLOAD_BYTES,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            max_dimension: 512,
            quality: 85,
        }
    }
}

impl From<&SearchConfig> for PreprocessOptions {
    fn from(config: &SearchConfig) -> Self {
        Self {
            max_size_bytes: config.max_upload_bytes,
            allowed_mime_types: config.allowed_mime_types.clone(),
            max_dimension: config.max_image_dimension,
            quality: config.canonical_quality,
        }
    }
}

impl PreprocessOptions {
    fn allows(&self, mime: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime))
    }
}

/// Output of [`preprocess`].
#[derive(Debug)]
pub struct CanonicalImage {
    /// JPEG bytes
    pub data: Vec<u8>,
    pub original_dimensions: (u32, u32),
    pub dimensions: (u32, u32),
    pub was_resized: bool,
}

/// Detect MIME type from magic bytes.
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    infer::get(data)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
}

/// Turn an arbitrary upload into a canonical bitmap for the encoder.
///
/// `declared_mime` is the client-supplied content type, if any; both it
/// and the sniffed type must be allow-listed.
pub fn preprocess(
    raw: &[u8],
    declared_mime: Option<&str>,
    opts: &PreprocessOptions,
) -> Result<CanonicalImage, PreprocessError> {
    if raw.is_empty() {
        return Err(PreprocessError::Empty);
    }
    if raw.len() > opts.max_size_bytes {
        return Err(PreprocessError::TooLarge {
            size: raw.len(),
            limit: opts.max_size_bytes,
        });
    }

    let declared = declared_mime
        .map(|m| m.split(';').next().unwrap_or(m).trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty() && m != "application/octet-stream");
    if let Some(declared) = &declared {
        if !opts.allows(declared) {
            return Err(PreprocessError::UnsupportedFormat(declared.clone()));
        }
    }

    let mime = match sniff_mime(raw) {
        Some(mime) if opts.allows(mime) => mime,
        Some(mime) => return Err(PreprocessError::UnsupportedFormat(mime.to_string())),
        // claims to be an allowed image but has no recognizable signature
        None if declared.is_some() => {
            return Err(PreprocessError::CorruptImage(
                "unrecognized image signature".to_string(),
            ))
        }
        None => return Err(PreprocessError::UnsupportedFormat("unknown".to_string())),
    };

    let format = ImageFormat::from_mime_type(mime)
        .ok_or_else(|| PreprocessError::UnsupportedFormat(mime.to_string()))?;
    let img = decode(raw, format)?;

    let (orig_w, orig_h) = img.dimensions();
    let (new_w, new_h, was_resized) = fit_within(orig_w, orig_h, opts.max_dimension);

    let processed = if was_resized {
        img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    let rgb = flatten_on_white(&processed);
    let dimensions = rgb.dimensions();

    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, opts.quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;

    Ok(CanonicalImage {
        data,
        original_dimensions: (orig_w, orig_h),
        dimensions,
        was_resized,
    })
}

fn decode(raw: &[u8], format: ImageFormat) -> Result<DynamicImage, PreprocessError> {
    let mut reader = image::ImageReader::with_format(Cursor::new(raw), format);
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(MAX_DECODE_SIDE);
    limits.max_image_height = Some(MAX_DECODE_SIDE);
    reader.limits(limits);

    let img = reader
        .decode()
        .map_err(|e| PreprocessError::CorruptImage(e.to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(PreprocessError::CorruptImage("image has no pixels".to_string()));
    }
    Ok(img)
}

/// New dimensions fitting inside `max_side` x `max_side` with the aspect
/// ratio kept. Never upscales.
fn fit_within(w: u32, h: u32, max_side: u32) -> (u32, u32, bool) {
    if w <= max_side && h <= max_side {
        return (w, h, false);
    }
    let scale = (max_side as f64) / (w.max(h) as f64);
    let new_w = ((w as f64) * scale).round() as u32;
    let new_h = ((h as f64) * scale).round() as u32;
    (new_w.clamp(1, max_side), new_h.clamp(1, max_side), true)
}

/// Drop alpha by compositing onto white so transparent product shots do
/// not turn black.
fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y).0;
        let a = p[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a)) / 255) as u8;
        image::Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
    })
}
