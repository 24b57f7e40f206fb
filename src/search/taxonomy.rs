//! Category/collection matches and query suggestions for text search.

use std::collections::HashSet;

use crate::catalog::TaxonomyEntry;

/// Entries whose name contains the query, case-insensitively. Names that
/// start with the query come first.
pub fn match_taxonomy(query: &str, entries: &[TaxonomyEntry], limit: usize) -> Vec<TaxonomyEntry> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return vec![];
    }

    let mut matched: Vec<(bool, &TaxonomyEntry)> = entries
        .iter()
        .filter_map(|e| {
            let name = e.name.to_lowercase();
            name.contains(&needle).then(|| (name.starts_with(&needle), e))
        })
        .collect();

    // stable: keeps catalog order within each group
    matched.sort_by_key(|(prefix, _)| !prefix);
    matched
        .into_iter()
        .take(limit)
        .map(|(_, e)| e.clone())
        .collect()
}

/// The query itself followed by matched taxonomy names and product titles,
/// deduplicated case-insensitively.
pub fn suggestions<'a>(
    query: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    limit: usize,
) -> Vec<String> {
    let query = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut seen = HashSet::new();
    let mut out = vec![];

    for s in std::iter::once(query.as_str()).chain(candidates.into_iter().map(|s| s)) {
        if out.len() >= limit {
            break;
        }
        let s = s.trim();
        if s.is_empty() {
            continue;
        }
        if seen.insert(s.to_lowercase()) {
            out.push(s.to_string());
        }
    }
    out
}
