//! Stored prompt templates, append-only.
//!
//! Prompts are never updated in place. Writing a prompt appends a new
//! version under its key, and reads either take the latest version or
//! the version that was current at a given point in time. This keeps a
//! full audit trail of how the agent rewrote its own prompts.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};

use crate::db::{DbError, Result};
use crate::template::Template;

#[derive(Debug, Clone)]
pub struct Prompt {
    pub key: String,
    pub create_time: DateTime<Utc>,
    pub create_block_id: i64,
    pub summary: String,
    pub template: String,
}

impl Prompt {
    pub fn create(
        tx: &Transaction,
        create_block_id: i64,
        key: &str,
        summary: &str,
        template: &str,
    ) -> Result<Prompt> {
        let now = Utc::now();
        tx.execute(
            "INSERT INTO prompt (key, create_time, create_block, summary, template)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, now.to_rfc3339(), create_block_id, summary, template],
        )?;
        Ok(Prompt {
            key: key.to_string(),
            create_time: now,
            create_block_id,
            summary: summary.to_string(),
            template: template.to_string(),
        })
    }

    /// Latest version of `key`, if the key exists.
    pub fn get_latest(tx: &Transaction, key: &str) -> Result<Option<Prompt>> {
        tx.query_row(
            "SELECT * FROM prompt WHERE key = ?1
             ORDER BY create_time DESC, rowid DESC
             LIMIT 1",
            [key],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// The version of `key` that was current at `as_of`.
    pub fn get_at(tx: &Transaction, key: &str, as_of: DateTime<Utc>) -> Result<Option<Prompt>> {
        tx.query_row(
            "SELECT * FROM prompt WHERE key = ?1 AND create_time <= ?2
             ORDER BY create_time DESC, rowid DESC
             LIMIT 1",
            params![key, as_of.to_rfc3339()],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Latest version of every key, ordered by key.
    pub fn list_latest(tx: &Transaction) -> Result<Vec<Prompt>> {
        let mut stmt = tx.prepare(
            "SELECT * FROM prompt p1
             WHERE rowid = (
                 SELECT rowid FROM prompt p2 WHERE p2.key = p1.key
                 ORDER BY create_time DESC, rowid DESC
                 LIMIT 1
             )
             ORDER BY key",
        )?;
        let prompts = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(prompts)
    }

    /// Every version of `key`, newest first.
    pub fn get_all_versions(tx: &Transaction, key: &str) -> Result<Vec<Prompt>> {
        let mut stmt = tx.prepare(
            "SELECT * FROM prompt WHERE key = ?1
             ORDER BY create_time DESC, rowid DESC",
        )?;
        let prompts = stmt
            .query_map([key], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(prompts)
    }

    pub fn version_count(tx: &Transaction, key: &str) -> Result<i64> {
        tx.query_row(
            "SELECT COUNT(*) FROM prompt WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    pub fn template(&self) -> Template {
        Template::new(self.template.clone())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Prompt> {
        let create_time: String = row.get("create_time")?;
        Ok(Prompt {
            key: row.get("key")?,
            create_time: super::parse_timestamp(&create_time).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "create_time".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            create_block_id: row.get("create_block")?,
            summary: row.get("summary")?,
            template: row.get("template")?,
        })
    }
}
