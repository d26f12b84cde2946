//! Fuzzy name search over wiki pages.
//!
//! Pages are matched through their known names. Each query gets a
//! similarity score against every name, scores aggregate per slug by
//! maximum, and multiple queries are fused with reciprocal rank fusion
//! so a page that matches several queries moderately can beat a page
//! that matches one query well.

use similar::TextDiff;

const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    /// 1-based position across the whole result set, not the page.
    pub rank: usize,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub results: Vec<SearchResult>,
    pub total_results: usize,
    pub results_page: usize,
    pub total_pages: usize,
}

/// Similarity of two strings as a 0..=100 score, case-insensitive.
fn ratio(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    f64::from(TextDiff::from_chars(a.as_str(), b.as_str()).ratio()) * 100.0
}

/// Search `(name, slug)` pairs with one or more queries.
///
/// `page` is 1-based; an out-of-range page returns an empty result list
/// but still reports the totals.
pub fn search_by_names(
    pairs: &[(String, String)],
    queries: &[String],
    page: usize,
    page_size: usize,
) -> SearchResults {
    let mut slugs: Vec<&str> = Vec::new();
    for (_, slug) in pairs {
        if !slugs.contains(&slug.as_str()) {
            slugs.push(slug);
        }
    }

    // One score per slug per query, aggregated by best-matching name.
    let mut rankings: Vec<Vec<usize>> = Vec::with_capacity(queries.len());
    for query in queries {
        let scores: Vec<f64> = slugs
            .iter()
            .map(|slug| {
                pairs
                    .iter()
                    .filter(|(_, s)| s == slug)
                    .map(|(name, _)| ratio(query, name))
                    .fold(0.0, f64::max)
            })
            .collect();
        let mut order: Vec<usize> = (0..slugs.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        // ranks[i] is the 1-based rank of slug i under this query.
        let mut ranks = vec![0usize; slugs.len()];
        for (position, &slug_index) in order.iter().enumerate() {
            ranks[slug_index] = position + 1;
        }
        rankings.push(ranks);
    }

    let mut fused: Vec<(f64, &str)> = slugs
        .iter()
        .enumerate()
        .map(|(i, slug)| {
            let score: f64 = rankings
                .iter()
                .map(|ranks| 1.0 / (RRF_K + ranks[i] as f64))
                .sum();
            (score, *slug)
        })
        .collect();
    fused.sort_by(|(score_a, _), (score_b, _)| score_b.total_cmp(score_a));

    let total_results = fused.len();
    let total_pages = total_results.div_ceil(page_size.max(1));
    let start = page.saturating_sub(1) * page_size;
    let results = fused
        .into_iter()
        .enumerate()
        .skip(start)
        .take(page_size)
        .map(|(index, (_, slug))| SearchResult {
            rank: index + 1,
            slug: slug.to_string(),
        })
        .collect();

    SearchResults {
        results,
        total_results,
        results_page: page,
        total_pages,
    }
}

/// The `limit` slugs most similar to `query`, best first. Used to
/// suggest alternatives when a slug lookup misses.
pub fn find_similar_slugs(slugs: &[String], query: &str, limit: usize) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = slugs
        .iter()
        .map(|slug| (ratio(query, slug), slug))
        .collect();
    scored.sort_by(|(score_a, _), (score_b, _)| score_b.total_cmp(score_a));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, slug)| slug.clone())
        .collect()
}
