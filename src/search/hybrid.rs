//! Hybrid scoring: merge text and image signals per product.
//!
//! The two signal sets are joined on product id (full outer join). Each
//! product ends up with exactly one [`Signal`] variant, and the weighting
//! rule is a match over those variants:
//! - `TextOnly(t)` scores `t`
//! - `ImageOnly(i)` scores `i`
//! - `Both` scores `text_weight * t + image_weight * i`
//!
//! A missing modality is never treated as a zero score.

use std::collections::HashMap;

pub const DEFAULT_TEXT_WEIGHT: f32 = 0.4;
pub const DEFAULT_IMAGE_WEIGHT: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    TextOnly(f32),
    ImageOnly(f32),
    Both { text: f32, image: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub text: f32,
    pub image: f32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEXT_WEIGHT,
            image: DEFAULT_IMAGE_WEIGHT,
        }
    }
}

impl Signal {
    pub fn score(&self, weights: Weights) -> f32 {
        match *self {
            Signal::TextOnly(text) => text,
            Signal::ImageOnly(image) => image,
            Signal::Both { text, image } => weights.text * text + weights.image * image,
        }
    }

    fn with_text(self, text: f32) -> Self {
        match self {
            Signal::ImageOnly(image) | Signal::Both { image, .. } => Signal::Both { text, image },
            Signal::TextOnly(_) => Signal::TextOnly(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub id: u64,
    pub signal: Signal,
    pub score: f32,
}

/// Full outer join of the text and image signal sets on product id.
pub fn join(text: &[(u64, f32)], image: &[(u64, f32)]) -> HashMap<u64, Signal> {
    let mut signals: HashMap<u64, Signal> = HashMap::with_capacity(text.len() + image.len());

    for &(id, score) in image {
        signals.insert(id, Signal::ImageOnly(score));
    }
    for &(id, score) in text {
        signals
            .entry(id)
            .and_modify(|s| *s = s.with_text(score))
            .or_insert(Signal::TextOnly(score));
    }

    signals
}

/// Score every joined product, drop anything below `threshold`, sort by
/// score descending (ties by id ascending) and keep at most `limit`.
pub fn combine(
    text: &[(u64, f32)],
    image: &[(u64, f32)],
    weights: Weights,
    threshold: f32,
    limit: usize,
) -> Vec<Scored> {
    let mut results: Vec<Scored> = join(text, image)
        .into_iter()
        .map(|(id, signal)| Scored {
            id,
            signal,
            score: signal.score(weights),
        })
        .filter(|s| s.score.is_finite() && s.score >= threshold)
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(limit);
    results
}
