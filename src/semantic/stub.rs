use super::encoder::{Encoder, EncodingError};
use super::normalize::l2_normalize_in_place;

/// Side of the thumbnail the stub derives image vectors from.
const THUMB_SIDE: u32 = 8;

/// Deterministic encoder used when `model` is `"stub"` and in tests.
///
/// Text vectors use the hashing trick over lowercase tokens, so texts that
/// share words land close together. Image vectors are built from an 8x8 RGB
/// thumbnail, so images with similar colour layout land close together.
/// The two halves do not share a meaningful space.
pub struct HashEncoder {
    dimensions: usize,
}

impl HashEncoder {
    pub const MODEL_NAME: &'static str = "stub";

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Encoder for HashEncoder {
    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode_image(&self, canonical: &[u8]) -> Result<Vec<f32>, EncodingError> {
        let img = image::load_from_memory(canonical)
            .map_err(|e| EncodingError::EncodingFailed(format!("stub decode: {}", e)))?;
        let thumb = img
            .resize_exact(THUMB_SIDE, THUMB_SIDE, image::imageops::FilterType::Triangle)
            .to_rgb8();

        let mut v = vec![0f32; self.dimensions];
        for (idx, value) in thumb.as_raw().iter().enumerate() {
            v[idx % self.dimensions] += (*value as f32 - 127.5) / 127.5;
        }
        // bias keeps uniform mid-grey images away from the zero vector
        let last = self.dimensions - 1;
        v[last] += 1.0;

        if !l2_normalize_in_place(&mut v) {
            return Err(EncodingError::EncodingFailed(
                "stub produced a zero vector".to_string(),
            ));
        }
        Ok(v)
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let lowered = text.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            tokens.push(lowered.as_str());
        }

        let mut v = vec![0f32; self.dimensions];
        for token in tokens {
            let h = crc32fast::hash(token.as_bytes()) as usize;
            let sign = if h & 1 == 0 { 1.0 } else { -1.0 };
            v[(h >> 1) % self.dimensions] += sign;
        }

        if !l2_normalize_in_place(&mut v) {
            return Err(EncodingError::EncodingFailed(
                "stub produced a zero vector".to_string(),
            ));
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::normalize::{dot, is_unit_norm};
    use image::{ImageFormat, Rgb, RgbImage};

    fn solid_png(rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(32, 32, Rgb(rgb));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_text_vectors_are_unit_and_deterministic() {
        let enc = HashEncoder::new(512);
        let a = enc.encode_text("Wooden Toy Train").unwrap();
        let b = enc.encode_text("wooden toy train").unwrap();
        assert_eq!(a.len(), 512);
        assert!(is_unit_norm(&a));
        assert_eq!(a, b);
    }

    #[test]
    fn test_shared_words_are_closer() {
        let enc = HashEncoder::new(512);
        let train = enc.encode_text("wooden toy train").unwrap();
        let toy = enc.encode_text("toy train set").unwrap();
        let kettle = enc.encode_text("stainless kettle").unwrap();
        assert!(dot(&train, &toy) > dot(&train, &kettle));
    }

    #[test]
    fn test_image_vectors_follow_colour() {
        let enc = HashEncoder::new(512);
        let red = enc.encode_image(&solid_png([220, 10, 10])).unwrap();
        let red2 = enc.encode_image(&solid_png([200, 30, 20])).unwrap();
        let blue = enc.encode_image(&solid_png([10, 10, 220])).unwrap();

        assert!(is_unit_norm(&red));
        assert!(dot(&red, &red2) > dot(&red, &blue));
    }

    #[test]
    fn test_grey_image_is_not_zero() {
        let enc = HashEncoder::new(512);
        let grey = enc.encode_image(&solid_png([127, 128, 127])).unwrap();
        assert!(is_unit_norm(&grey));
    }

    #[test]
    fn test_garbage_image_fails() {
        let enc = HashEncoder::new(512);
        assert!(enc.encode_image(&[0xAB; 64]).is_err());
    }
}
