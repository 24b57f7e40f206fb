//! Lexical (keyword) scoring for product text search.
//!
//! A product's text score is the weighted max of three signals, each in
//! `[0, 1]`:
//! - full-text rank: share of query terms found among the product's words
//!   (name hits count fully, description hits at half weight)
//! - trigram similarity between the query and the product name
//! - prefix bonus when the name (or one of its words) starts with the query
//!
//! Taking the max lets typos ("robto") and partial input ("rob") match
//! where term matching alone would miss.

use std::collections::HashSet;

use crate::catalog::Product;

pub const FTS_WEIGHT: f32 = 1.0;
pub const TRIGRAM_WEIGHT: f32 = 0.9;
pub const PREFIX_WEIGHT: f32 = 0.8;

/// Description matches are worth half a name match
const DESCRIPTION_HIT: f32 = 0.5;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "in", "on", "at", "to", "for", "of", "with", "by", "from",
    "as", "and", "or", "but", "not", "no",
];

/// Lowercase alphanumeric terms with stop words dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty() && !STOP_WORDS.contains(&s.as_str()))
        .collect()
}

/// Crude English suffix folding so "robots" matches "robot".
pub fn stem(term: &str) -> String {
    let n = term.chars().count();
    if n > 4 && term.ends_with("ies") {
        return format!("{}y", &term[..term.len() - 3]);
    }
    if n > 4 && (term.ends_with("ches") || term.ends_with("shes") || term.ends_with("xes")) {
        return term[..term.len() - 2].to_string();
    }
    if n > 3 && term.ends_with('s') && !term.ends_with("ss") {
        return term[..term.len() - 1].to_string();
    }
    term.to_string()
}

fn stems(text: &str) -> HashSet<String> {
    tokenize(text).iter().map(|t| stem(t)).collect()
}

/// Share of query terms present in the product's name/description.
pub fn fts_rank(query_terms: &[String], product: &Product) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let name = stems(&product.name);
    let description = stems(&product.description);

    let hits: f32 = query_terms
        .iter()
        .map(|t| stem(t))
        .map(|t| {
            if name.contains(&t) {
                1.0
            } else if description.contains(&t) {
                DESCRIPTION_HIT
            } else {
                0.0
            }
        })
        .sum();

    hits / query_terms.len() as f32
}

fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let mut out = HashSet::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.to_lowercase().chars())
            .chain(" ".chars())
            .collect();
        for w in padded.windows(3) {
            out.insert([w[0], w[1], w[2]]);
        }
    }
    out
}

/// Jaccard similarity of word trigram sets, words padded with two leading
/// blanks and one trailing blank.
pub fn trigram_similarity(a: &str, b: &str) -> f32 {
    let a = trigrams(a);
    let b = trigrams(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    let union = a.len() + b.len() - shared;
    shared as f32 / union as f32
}

/// 1.0 when the whole name starts with the query, 0.75 when one of its
/// words does.
pub fn prefix_bonus(query: &str, name: &str) -> f32 {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return 0.0;
    }
    let name = name.trim().to_lowercase();
    if name.starts_with(&query) {
        return 1.0;
    }
    let word_prefix = name
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| !w.is_empty() && w.starts_with(&query));
    if word_prefix {
        0.75
    } else {
        0.0
    }
}

/// Combined lexical score of `product` for `query`, in `[0, 1]`.
pub fn text_score(query: &str, product: &Product) -> f32 {
    let terms = tokenize(query);
    let fts = fts_rank(&terms, product);
    let trigram = trigram_similarity(query, &product.name);
    let prefix = prefix_bonus(query, &product.name);

    (FTS_WEIGHT * fts)
        .max(TRIGRAM_WEIGHT * trigram)
        .max(PREFIX_WEIGHT * prefix)
        .clamp(0.0, 1.0)
}

/// Every product with a positive text score, as `(id, score)`.
pub fn score_products(query: &str, products: &[Product]) -> Vec<(u64, f32)> {
    products
        .iter()
        .filter_map(|p| {
            let score = text_score(query, p);
            (score > 0.0).then_some((p.id, score))
        })
        .collect()
}
