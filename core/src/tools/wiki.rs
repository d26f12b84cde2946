//! Wiki reading, writing, and search.

use rusqlite::Transaction;
use schemars::JsonSchema;
use serde::Deserialize;

use super::ToolError;
use crate::links::extract_wiki_links;
use crate::models::{Block, Chapter, WikiPage};
use crate::search;

const SEARCH_PAGE_SIZE: usize = 6;
const SUGGESTION_LIMIT: usize = 3;

fn current_chapter(tx: &Transaction) -> Result<Chapter, ToolError> {
    Chapter::get_latest_started(tx)?
        .ok_or_else(|| ToolError::Solvable("No chapter has been started yet.".to_string()))
}

/// "Did you mean" lines for a slug that missed, one per similar page.
fn suggestion_lines(tx: &Transaction, chapter_id: i64, slug: &str) -> Result<String, ToolError> {
    let slugs = WikiPage::get_all_slugs(tx, chapter_id)?;
    let mut lines = String::new();
    for candidate in search::find_similar_slugs(&slugs, slug, SUGGESTION_LIMIT) {
        if let Some(page) = WikiPage::read_page_at(tx, &candidate, chapter_id)? {
            lines.push_str(&format!(
                "\n  - {} ({}) {}",
                page.title, page.slug, page.summary
            ));
        }
    }
    Ok(lines)
}

fn missing_page_error(tx: &Transaction, chapter_id: i64, slug: &str) -> Result<ToolError, ToolError> {
    let suggestions = suggestion_lines(tx, chapter_id, slug)?;
    let mut message = format!("Wiki page '{slug}' does not exist.");
    if !suggestions.is_empty() {
        message.push_str("\nSimilar pages:");
        message.push_str(&suggestions);
    }
    Ok(ToolError::Solvable(message))
}

/// Reject bodies that link to slugs with no page behind them.
fn validate_links(
    tx: &Transaction,
    chapter_id: i64,
    own_slug: &str,
    body: &str,
) -> Result<(), ToolError> {
    let known = WikiPage::get_all_slugs(tx, chapter_id)?;
    let mut broken: Vec<String> = Vec::new();
    for link in extract_wiki_links(body) {
        if link.slug != own_slug && !known.contains(&link.slug) && !broken.contains(&link.slug) {
            broken.push(link.slug);
        }
    }
    if broken.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = broken
        .iter()
        .map(|slug| format!("- Slug '{slug}' does not reference a page in the wiki"))
        .collect();
    Err(ToolError::Solvable(format!(
        "The body contains broken links:\n{}",
        lines.join("\n")
    )))
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadWikiPageParams {
    /// Slug of the page to read.
    pub slug: String,
}

impl ReadWikiPageParams {
    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        let chapter = current_chapter(tx)?;
        let Some(page) = WikiPage::read_page_at(tx, &self.slug, chapter.id)? else {
            return Err(missing_page_error(tx, chapter.id, &self.slug)?);
        };
        let names = page.names(tx)?;
        let response = format!(
            "# {}\nKnown names: {}\nSummary: {}\n\n{}",
            page.title,
            names.join(", "),
            page.summary,
            page.body
        );
        block.respond(tx, &response)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WriteWikiPageParams {
    /// Slug of the page to write.
    pub slug: String,
    pub title: Option<String>,
    /// Names and aliases the page can be found under.
    pub names: Option<Vec<String>>,
    pub summary: Option<String>,
    pub body: Option<String>,
    /// True to create a new page; false to update an existing one.
    pub create: bool,
    /// Set to delete the page instead. Links to it are redirected to
    /// this slug, or unlinked entirely if this is an empty string.
    pub delete_and_redirect_to: Option<String>,
}

impl WriteWikiPageParams {
    fn has_content(&self) -> bool {
        self.title.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.names.as_ref().is_some_and(|n| !n.is_empty())
            || self.summary.as_deref().is_some_and(|s| !s.trim().is_empty())
            || self.body.as_deref().is_some_and(|b| !b.trim().is_empty())
    }

    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        let chapter = current_chapter(tx)?;
        if let Some(redirect_to) = &self.delete_and_redirect_to {
            return self.delete(tx, block, chapter.id, redirect_to);
        }
        if self.create {
            self.create_page(tx, block, chapter.id)
        } else {
            self.update_page(tx, block, chapter.id)
        }
    }

    fn delete(
        &self,
        tx: &Transaction,
        block: &Block,
        chapter_id: i64,
        redirect_to: &str,
    ) -> Result<(), ToolError> {
        if self.has_content() {
            return Err(ToolError::Solvable(
                "Cannot set title, names, summary, or body when deleting a page.".to_string(),
            ));
        }
        let Some(page) = WikiPage::read_page_at(tx, &self.slug, chapter_id)? else {
            return Err(missing_page_error(tx, chapter_id, &self.slug)?);
        };
        if !redirect_to.is_empty() {
            if redirect_to == self.slug {
                return Err(ToolError::Solvable(
                    "Cannot redirect a page to itself.".to_string(),
                ));
            }
            if WikiPage::read_page_at(tx, redirect_to, chapter_id)?.is_none() {
                return Err(missing_page_error(tx, chapter_id, redirect_to)?);
            }
        }
        let message = page.delete_and_redirect(tx, block.id, chapter_id, redirect_to)?;
        block.respond(tx, &message)?;
        Ok(())
    }

    fn create_page(&self, tx: &Transaction, block: &Block, chapter_id: i64) -> Result<(), ToolError> {
        if WikiPage::read_page_at(tx, &self.slug, chapter_id)?.is_some() {
            return Err(ToolError::Solvable(format!(
                "Wiki page '{}' already exists. Set create to false to update it.",
                self.slug
            )));
        }
        let (Some(title), Some(names), Some(summary), Some(body)) =
            (&self.title, &self.names, &self.summary, &self.body)
        else {
            return Err(ToolError::Solvable(
                "Creating a page requires title, names, summary, and body.".to_string(),
            ));
        };
        if title.trim().is_empty() || names.is_empty() {
            return Err(ToolError::Solvable(
                "Creating a page requires a non-empty title and at least one name.".to_string(),
            ));
        }
        validate_links(tx, chapter_id, &self.slug, body)?;
        WikiPage::create(tx, block.id, chapter_id, &self.slug, title, names, summary, body)?;
        block.respond(tx, &format!("Wrote wiki page '{}'.", self.slug))?;
        Ok(())
    }

    fn update_page(&self, tx: &Transaction, block: &Block, chapter_id: i64) -> Result<(), ToolError> {
        let Some(page) = WikiPage::read_page_at(tx, &self.slug, chapter_id)? else {
            let suggestions = suggestion_lines(tx, chapter_id, &self.slug)?;
            let mut message = format!(
                "Wiki page '{}' does not exist. Set create to true to create it.",
                self.slug
            );
            if !suggestions.is_empty() {
                message.push_str("\nSimilar pages:");
                message.push_str(&suggestions);
            }
            return Err(ToolError::Solvable(message));
        };

        // Absent or empty fields keep their previous values.
        let title = merged(&self.title, &page.title);
        let summary = merged(&self.summary, &page.summary);
        let body = merged(&self.body, &page.body);
        let names = match &self.names {
            Some(names) if !names.is_empty() => names.clone(),
            _ => page.names(tx)?,
        };
        validate_links(tx, chapter_id, &self.slug, &body)?;
        WikiPage::create(tx, block.id, chapter_id, &self.slug, &title, &names, &summary, &body)?;
        block.respond(tx, &format!("Wrote wiki page '{}'.", self.slug))?;
        Ok(())
    }
}

fn merged(new: &Option<String>, old: &str) -> String {
    match new {
        Some(value) if !value.is_empty() => value.clone(),
        _ => old.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchWikiByNameParams {
    /// 1-based result page, defaulting to the first.
    pub results_page: Option<u32>,
    /// Names to search for. Multiple names fuse into one ranking.
    pub names: Vec<String>,
}

impl SearchWikiByNameParams {
    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        if self.names.is_empty() {
            return Err(ToolError::Solvable(
                "Provide at least one name to search for.".to_string(),
            ));
        }
        let chapter = current_chapter(tx)?;
        let page = self.results_page.unwrap_or(1).max(1) as usize;
        let pairs = WikiPage::get_name_slug_pairs(tx, chapter.id)?;
        let results = search::search_by_names(&pairs, &self.names, page, SEARCH_PAGE_SIZE);

        if results.total_results == 0 {
            block.respond(tx, "No wiki pages found.")?;
            return Ok(());
        }
        if results.results.is_empty() {
            block.respond(tx, &format!("No results found on page {page}"))?;
            return Ok(());
        }

        let mut entries = Vec::with_capacity(results.results.len());
        for result in &results.results {
            let Some(found) = WikiPage::read_page_at(tx, &result.slug, chapter.id)? else {
                continue;
            };
            let names = found.names(tx)?;
            entries.push(format!(
                "{}. {} - {}\n   Names: {}\n   Summary: {}",
                result.rank,
                found.title,
                found.slug,
                names.join(", "),
                found.summary
            ));
        }
        let response = format!(
            "Search Results (Page {}, showing {} of {} total):\n\n{}",
            results.results_page,
            entries.len(),
            results.total_results,
            entries.join("\n\n")
        );
        block.respond(tx, &response)?;
        Ok(())
    }
}
