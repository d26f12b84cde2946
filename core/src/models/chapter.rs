//! Book chapters and their processing lifecycle.
//!
//! Chapters are imported once, up front, with dense ids starting at 0.
//! A chapter is "started" once a conversation has been created for it;
//! the worker starts chapters strictly in id order.

use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::info;

use super::wikipage::WikiPage;
use crate::db::{DbError, Result};

#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: i64,
    /// Heading path, outermost first ("Book One" > "Chapter 3").
    pub name: Vec<String>,
    pub text: String,
    pub conversation_id: Option<i64>,
    pub chapter_summary_page_id: Option<i64>,
}

impl Chapter {
    pub fn create(tx: &Transaction, id: i64, name: &[String], text: &str) -> Result<Chapter> {
        if name.is_empty() {
            return Err(DbError::Invariant(format!(
                "chapter {id} has an empty name path"
            )));
        }
        let name_json = serde_json::to_string(name)
            .map_err(|e| DbError::Invariant(format!("unserializable chapter name: {e}")))?;
        tx.execute(
            "INSERT INTO chapter (id, name, text, conversation_id, chapter_summary_page_id)
             VALUES (?1, ?2, ?3, NULL, NULL)",
            params![id, name_json, text],
        )?;
        Ok(Chapter {
            id,
            name: name.to_vec(),
            text: text.to_string(),
            conversation_id: None,
            chapter_summary_page_id: None,
        })
    }

    pub fn get_by_id(tx: &Transaction, chapter_id: i64) -> Result<Option<Chapter>> {
        tx.query_row(
            "SELECT * FROM chapter WHERE id = ?1",
            [chapter_id],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// The chapter driven by the given conversation, if any. Only root
    /// conversations are bound to chapters.
    pub fn get_by_conversation(tx: &Transaction, conversation_id: i64) -> Result<Option<Chapter>> {
        tx.query_row(
            "SELECT * FROM chapter WHERE conversation_id = ?1",
            [conversation_id],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// The highest-id chapter that has a conversation.
    pub fn get_latest_started(tx: &Transaction) -> Result<Option<Chapter>> {
        tx.query_row(
            "SELECT * FROM chapter
             WHERE conversation_id IS NOT NULL
             ORDER BY id DESC
             LIMIT 1",
            [],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// The lowest-id chapter with no conversation yet.
    pub fn find_first_unstarted(tx: &Transaction) -> Result<Option<Chapter>> {
        tx.query_row(
            "SELECT * FROM chapter
             WHERE conversation_id IS NULL
             ORDER BY id
             LIMIT 1",
            [],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn count(tx: &Transaction) -> Result<i64> {
        tx.query_row("SELECT COUNT(*) FROM chapter", [], |row| row.get(0))
            .map_err(DbError::from)
    }

    /// Bind this chapter to its conversation and carry the previous
    /// chapter's current wiki pages forward.
    pub fn start(&self, tx: &Transaction, conversation_id: i64) -> Result<()> {
        info!(chapter = self.id, conversation = conversation_id, "starting chapter");
        tx.execute(
            "UPDATE chapter SET conversation_id = ?1 WHERE id = ?2",
            params![conversation_id, self.id],
        )?;
        WikiPage::copy_current_for_new_chapter(tx, self.id)?;
        Ok(())
    }

    pub fn set_chapter_summary_page(&self, tx: &Transaction, page_id: i64) -> Result<()> {
        tx.execute(
            "UPDATE chapter SET chapter_summary_page_id = ?1 WHERE id = ?2",
            params![page_id, self.id],
        )?;
        Ok(())
    }

    /// Display name, heading path joined with " > ".
    pub fn display_name(&self) -> String {
        self.name.join(" > ")
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Chapter> {
        let name_json: String = row.get("name")?;
        let name: Vec<String> = serde_json::from_str(&name_json).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                "name".to_string(),
                rusqlite::types::Type::Text,
            )
        })?;
        Ok(Chapter {
            id: row.get("id")?,
            name,
            text: row.get("text")?,
            conversation_id: row.get("conversation_id")?,
            chapter_summary_page_id: row.get("chapter_summary_page_id")?,
        })
    }
}
