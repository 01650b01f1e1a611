use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};

/// Maximum number of titles compiled into one alternation.
pub const CHUNK_SIZE: usize = 500;

const PATTERN_SIZE_LIMIT: usize = 64 * (1 << 20);

/// Compile whole-word alternation patterns, longest titles first.
///
/// The regex engine picks the first alternative that matches at a position,
/// so ordering by length makes "Times Square" win over "Square". Chunking only
/// bounds pattern size; it never reorders titles.
pub fn build_patterns<'a, I>(titles: I) -> Vec<Regex>
where
    I: IntoIterator<Item = &'a str>,
{
    build_patterns_with_limit(titles, PATTERN_SIZE_LIMIT)
}

/// A chunk that exceeds `size_limit` is logged and skipped; the others still apply.
fn build_patterns_with_limit<'a, I>(titles: I, size_limit: usize) -> Vec<Regex>
where
    I: IntoIterator<Item = &'a str>,
{
    let ordered = order_titles(titles);
    ordered
        .chunks(CHUNK_SIZE)
        .filter_map(|chunk| {
            let alternation = chunk
                .iter()
                .map(|title| regex::escape(title))
                .collect::<Vec<_>>()
                .join("|");
            match RegexBuilder::new(&format!(r"\b(?:{alternation})\b"))
                .size_limit(size_limit)
                .build()
            {
                Ok(pattern) => Some(pattern),
                Err(error) => {
                    tracing::error!(%error, titles = chunk.len(), "Skipping title pattern chunk that failed to compile");
                    None
                }
            }
        })
        .collect()
}

/// Deduplicated, non-empty titles sorted by byte length descending, then lexicographically.
pub fn order_titles<'a, I>(titles: I) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ordered = titles
        .into_iter()
        .filter(|title| !title.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    ordered.sort_by(|left, right| right.len().cmp(&left.len()).then_with(|| left.cmp(right)));
    ordered
}
