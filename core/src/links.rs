//! Markdown link extraction for wiki cross-references.
//!
//! Wiki bodies reference other pages with ordinary markdown links,
//! `[display text](target)`. The slug is the final path component of the
//! target, so `[Frodo](characters/frodo-baggins)` links to the page with
//! slug `frodo-baggins`.

use regex_lite::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLink {
    pub display_text: String,
    /// Original target text from the markdown.
    pub target: String,
    /// Slug extracted from the target.
    pub slug: String,
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap()
    })
}

/// Extract the slug from a link target: strip trailing slashes, then take
/// everything after the last remaining slash.
pub fn extract_slug_from_target(target: &str) -> String {
    let trimmed = target.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, slug)) => slug.to_string(),
        None => trimmed.to_string(),
    }
}

/// Extract all markdown links from `text`.
pub fn extract_wiki_links(text: &str) -> Vec<WikiLink> {
    link_pattern()
        .captures_iter(text)
        .map(|caps| {
            let display_text = caps[1].to_string();
            let target = caps[2].to_string();
            let slug = extract_slug_from_target(&target);
            WikiLink {
                display_text,
                target,
                slug,
            }
        })
        .collect()
}
