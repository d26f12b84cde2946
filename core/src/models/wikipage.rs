//! Versioned wiki pages.
//!
//! Every write appends a new `wiki_page` row; `wiki_page_current` maps
//! `(chapter, slug)` to the version visible at that chapter. Starting a
//! chapter copies the previous chapter's mapping forward, so the wiki can
//! be read as of any started chapter. A version with an empty title is a
//! tombstone: writing one removes the slug from the current mapping.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::debug;

use crate::db::{DbError, Result};
use crate::links::extract_wiki_links;

const RRF_K: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct WikiPage {
    pub id: i64,
    pub chapter_id: i64,
    pub slug: String,
    pub create_time: DateTime<Utc>,
    pub create_block_id: i64,
    pub title: String,
    pub summary: String,
    pub body: String,
}

/// Canonical form used to decide whether two names are "the same".
/// Punctuation and underscores become spaces, runs of whitespace
/// collapse, everything lowercases, and a leading "the " is dropped
/// from names long enough to survive it.
pub fn normalize_name_key(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let mut key = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if key.len() > 4 {
        if let Some(stripped) = key.strip_prefix("the ") {
            key = stripped.to_string();
        }
    }
    key
}

/// Pick the most presentable of a set of equivalent names: longest wins,
/// then the one with more uppercase letters, then lexicographic order.
fn select_best_name(names: &[&str]) -> String {
    names
        .iter()
        .max_by(|a, b| {
            let upper_a = a.chars().filter(|c| c.is_uppercase()).count();
            let upper_b = b.chars().filter(|c| c.is_uppercase()).count();
            a.len()
                .cmp(&b.len())
                .then(upper_a.cmp(&upper_b))
                .then(a.cmp(b))
        })
        .map(|n| n.to_string())
        .unwrap_or_default()
}

/// Collapse names that normalize to the same key, keeping the best
/// spelling of each. Names that normalize to nothing are dropped, unless
/// every name does, in which case the first survives as-is.
pub fn deduplicate_names(names: &[String]) -> Vec<String> {
    let mut groups: Vec<(String, Vec<&str>)> = Vec::new();
    for name in names {
        let key = normalize_name_key(name);
        if key.is_empty() {
            continue;
        }
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(name.as_str()),
            None => groups.push((key, vec![name.as_str()])),
        }
    }
    if groups.is_empty() {
        return names.first().cloned().into_iter().collect();
    }
    let mut result: Vec<String> = groups
        .iter()
        .map(|(_, members)| select_best_name(members))
        .collect();
    result.sort();
    result
}

impl WikiPage {
    /// Append a new version of `slug` as of `chapter_id` and point the
    /// current mapping at it. An empty title tombstones the slug instead.
    pub fn create(
        tx: &Transaction,
        create_block_id: i64,
        chapter_id: i64,
        slug: &str,
        title: &str,
        names: &[String],
        summary: &str,
        body: &str,
    ) -> Result<WikiPage> {
        let now = Utc::now();
        tx.execute(
            "INSERT INTO wiki_page (chapter, slug, create_time, create_block, title, summary, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![chapter_id, slug, now.to_rfc3339(), create_block_id, title, summary, body],
        )?;
        let page_id = tx.last_insert_rowid();

        for name in deduplicate_names(names) {
            tx.execute("INSERT OR IGNORE INTO wiki_name (name) VALUES (?1)", [&name])?;
            let name_id: i64 = tx.query_row(
                "SELECT id FROM wiki_name WHERE name = ?1",
                [&name],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO wiki_page_name (wiki_page_id, wiki_name_id) VALUES (?1, ?2)",
                params![page_id, name_id],
            )?;
        }

        if title.is_empty() {
            debug!(slug, chapter = chapter_id, "tombstoned wiki page");
            tx.execute(
                "DELETE FROM wiki_page_current WHERE chapter = ?1 AND slug = ?2",
                params![chapter_id, slug],
            )?;
        } else {
            tx.execute(
                "INSERT INTO wiki_page_current (chapter, slug, wiki_page)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(chapter, slug) DO UPDATE SET wiki_page = excluded.wiki_page",
                params![chapter_id, slug, page_id],
            )?;
        }

        Ok(WikiPage {
            id: page_id,
            chapter_id,
            slug: slug.to_string(),
            create_time: now,
            create_block_id,
            title: title.to_string(),
            summary: summary.to_string(),
            body: body.to_string(),
        })
    }

    /// Carry the previous chapter's current mapping into `chapter_id`.
    pub fn copy_current_for_new_chapter(tx: &Transaction, chapter_id: i64) -> Result<()> {
        tx.execute(
            "INSERT INTO wiki_page_current (chapter, slug, wiki_page)
             SELECT ?1, slug, wiki_page FROM wiki_page_current WHERE chapter = ?1 - 1",
            [chapter_id],
        )?;
        Ok(())
    }

    /// The version of `slug` visible as of `chapter_id`, if any.
    pub fn read_page_at(tx: &Transaction, slug: &str, chapter_id: i64) -> Result<Option<WikiPage>> {
        tx.query_row(
            "SELECT wp.* FROM wiki_page wp
             JOIN wiki_page_current c ON c.wiki_page = wp.id
             WHERE c.chapter = ?1 AND c.slug = ?2",
            params![chapter_id, slug],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn get_by_id(tx: &Transaction, page_id: i64) -> Result<Option<WikiPage>> {
        tx.query_row(
            "SELECT * FROM wiki_page WHERE id = ?1",
            [page_id],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Known names for this version, sorted.
    pub fn names(&self, tx: &Transaction) -> Result<Vec<String>> {
        let mut stmt = tx.prepare(
            "SELECT wn.name FROM wiki_name wn
             JOIN wiki_page_name pn ON pn.wiki_name_id = wn.id
             WHERE pn.wiki_page_id = ?1
             ORDER BY wn.name",
        )?;
        let names = stmt
            .query_map([self.id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Slugs with a live page as of `chapter_id`, sorted.
    pub fn get_all_slugs(tx: &Transaction, chapter_id: i64) -> Result<Vec<String>> {
        let mut stmt = tx.prepare(
            "SELECT slug FROM wiki_page_current WHERE chapter = ?1 ORDER BY slug",
        )?;
        let slugs = stmt
            .query_map([chapter_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(slugs)
    }

    /// Distinct `(name, slug)` pairs live as of `chapter_id`.
    pub fn get_name_slug_pairs(tx: &Transaction, chapter_id: i64) -> Result<Vec<(String, String)>> {
        let mut stmt = tx.prepare(
            "SELECT DISTINCT wn.name, c.slug
             FROM wiki_page_current c
             JOIN wiki_page_name pn ON pn.wiki_page_id = c.wiki_page
             JOIN wiki_name wn ON wn.id = pn.wiki_name_id
             WHERE c.chapter = ?1
             ORDER BY wn.name, c.slug",
        )?;
        let pairs = stmt
            .query_map([chapter_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    /// All pages live as of `chapter_id`, ordered by importance.
    ///
    /// Importance fuses two signals with reciprocal rank fusion: how
    /// recently the page was last edited (its version's chapter) and how
    /// many distinct chapters have a version of it. Ties break toward
    /// the longer body.
    pub fn get_all_pages_ranked(tx: &Transaction, chapter_id: i64) -> Result<Vec<WikiPage>> {
        let mut stmt = tx.prepare(
            "SELECT wp.*, COUNT(DISTINCT wp2.chapter) AS distinct_chapters
             FROM wiki_page_current c
             JOIN wiki_page wp ON wp.id = c.wiki_page
             JOIN wiki_page wp2 ON wp2.slug = wp.slug AND wp2.chapter <= ?1
             WHERE c.chapter = ?1
             GROUP BY wp.id",
            )?;
        let rows = stmt
            .query_map([chapter_id], |row| {
                Ok((Self::from_row(row)?, row.get::<_, i64>("distinct_chapters")?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let latest_chapters: Vec<i64> = rows.iter().map(|(p, _)| p.chapter_id).collect();
        let frequencies: Vec<i64> = rows.iter().map(|(_, f)| *f).collect();
        let latest_ranks = dense_ranks(&latest_chapters);
        let frequency_ranks = dense_ranks(&frequencies);

        let mut scored: Vec<(f64, WikiPage)> = rows
            .into_iter()
            .enumerate()
            .map(|(i, (page, _))| {
                let score = 1.0 / (RRF_K + latest_ranks[i] as f64)
                    + 1.0 / (RRF_K + frequency_ranks[i] as f64);
                (score, page)
            })
            .collect();
        scored.sort_by(|(score_a, page_a), (score_b, page_b)| {
            score_b
                .total_cmp(score_a)
                .then(page_b.body.len().cmp(&page_a.body.len()))
        });
        Ok(scored.into_iter().map(|(_, page)| page).collect())
    }

    /// Tombstone this page as of `chapter_id` and fix up every live page
    /// that links to it.
    ///
    /// With an empty `redirect_to`, links collapse to their bare display
    /// text. Otherwise each link target keeps its path prefix and swaps
    /// the final slug for `redirect_to`. Rewritten pages are appended as
    /// new versions attributed to `create_block_id`. Returns the message
    /// describing what happened.
    pub fn delete_and_redirect(
        &self,
        tx: &Transaction,
        create_block_id: i64,
        chapter_id: i64,
        redirect_to: &str,
    ) -> Result<String> {
        let mut updated = 0usize;
        for slug in Self::get_all_slugs(tx, chapter_id)? {
            if slug == self.slug {
                continue;
            }
            let Some(page) = Self::read_page_at(tx, &slug, chapter_id)? else {
                continue;
            };
            let links: Vec<_> = extract_wiki_links(&page.body)
                .into_iter()
                .filter(|link| link.slug == self.slug)
                .collect();
            if links.is_empty() {
                continue;
            }
            let mut body = page.body.clone();
            for link in links {
                let original = format!("[{}]({})", link.display_text, link.target);
                let replacement = if redirect_to.is_empty() {
                    link.display_text.clone()
                } else {
                    let new_target = redirect_target(&link.target, redirect_to);
                    format!("[{}]({})", link.display_text, new_target)
                };
                body = body.replace(&original, &replacement);
            }
            let names = page.names(tx)?;
            Self::create(
                tx,
                create_block_id,
                chapter_id,
                &page.slug,
                &page.title,
                &names,
                &page.summary,
                &body,
            )?;
            updated += 1;
        }

        Self::create(
            tx,
            create_block_id,
            chapter_id,
            &self.slug,
            "",
            &[String::new()],
            "",
            "",
        )?;

        let mut message = if redirect_to.is_empty() {
            format!("Wiki page '{}' deleted and all links removed.", self.slug)
        } else {
            format!(
                "Wiki page '{}' deleted and all links redirected to '{redirect_to}'.",
                self.slug
            )
        };
        if updated > 0 {
            message.push_str(&format!(" Updated {updated} page(s) with redirected links."));
        }
        Ok(message)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<WikiPage> {
        let create_time: String = row.get("create_time")?;
        Ok(WikiPage {
            id: row.get("id")?,
            chapter_id: row.get("chapter")?,
            slug: row.get("slug")?,
            create_time: super::parse_timestamp(&create_time).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "create_time".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            create_block_id: row.get("create_block")?,
            title: row.get("title")?,
            summary: row.get("summary")?,
            body: row.get("body")?,
        })
    }
}

/// Swap the final path component of `target` for `slug`, keeping any
/// directory-style prefix.
fn redirect_target(target: &str, slug: &str) -> String {
    let trimmed = target.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((prefix, _)) => format!("{prefix}/{slug}"),
        None => slug.to_string(),
    }
}

/// Dense descending ranks: the largest value gets rank 1, ties share a
/// rank, and the next distinct value gets the next rank.
fn dense_ranks(values: &[i64]) -> Vec<usize> {
    let mut distinct: Vec<i64> = values.to_vec();
    distinct.sort_unstable_by(|a, b| b.cmp(a));
    distinct.dedup();
    values
        .iter()
        .map(|v| {
            distinct
                .iter()
                .position(|d| d == v)
                .map(|p| p + 1)
                .unwrap_or(1)
        })
        .collect()
}
