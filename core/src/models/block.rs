//! Conversation blocks: text messages and tool uses.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use strum_macros::{Display, EnumString};

use super::conversation::Conversation;
use super::parse_timestamp;
use crate::db::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TextRole {
    User,
    Assistant,
}

/// One block of a conversation. Exactly one of the tool fields group or
/// the text fields group is populated.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: i64,
    pub conversation_id: i64,
    pub create_time: DateTime<Utc>,
    pub generation: i64,
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_params: Option<String>,
    pub tool_response: Option<String>,
    pub text_role: Option<TextRole>,
    pub text_body: Option<String>,
    pub sent: bool,
    pub errored: bool,
}

impl Block {
    pub fn get_by_id(tx: &Transaction, block_id: i64) -> Result<Option<Block>> {
        tx.query_row(
            "SELECT * FROM block WHERE id = ?1",
            [block_id],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// All blocks for the given tool that have no response yet, newest
    /// first. This is how out-of-band answers (expert feedback) find
    /// their pending requests.
    pub fn unresponded_by_tool(tx: &Transaction, tool_name: &str) -> Result<Vec<Block>> {
        let mut stmt = tx.prepare(
            "SELECT * FROM block
             WHERE tool_name = ?1
             AND (tool_response IS NULL OR tool_response = '')
             ORDER BY create_time DESC",
        )?;
        let blocks = stmt
            .query_map([tool_name], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    pub fn create_tool_use(
        tx: &Transaction,
        conversation_id: i64,
        generation: i64,
        name: &str,
        use_id: &str,
        params_json: &str,
    ) -> Result<Block> {
        let now = Utc::now();
        tx.execute(
            "INSERT INTO block (conversation, create_time, generation, tool_name,
             tool_use_id, tool_params, sent, errored)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
            params![
                conversation_id,
                now.to_rfc3339(),
                generation,
                name,
                use_id,
                params_json
            ],
        )?;
        Ok(Block {
            id: tx.last_insert_rowid(),
            conversation_id,
            create_time: now,
            generation,
            tool_name: Some(name.to_string()),
            tool_use_id: Some(use_id.to_string()),
            tool_params: Some(params_json.to_string()),
            tool_response: None,
            text_role: None,
            text_body: None,
            sent: false,
            errored: false,
        })
    }

    pub fn create_text(
        tx: &Transaction,
        conversation_id: i64,
        generation: i64,
        role: TextRole,
        text: &str,
        sent: bool,
    ) -> Result<Block> {
        let now = Utc::now();
        tx.execute(
            "INSERT INTO block (conversation, create_time, generation, text_role,
             text_body, sent, errored)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                conversation_id,
                now.to_rfc3339(),
                generation,
                role.to_string(),
                text,
                sent
            ],
        )?;
        Ok(Block {
            id: tx.last_insert_rowid(),
            conversation_id,
            create_time: now,
            generation,
            tool_name: None,
            tool_use_id: None,
            tool_params: None,
            tool_response: None,
            text_role: Some(role),
            text_body: Some(text.to_string()),
            sent,
            errored: false,
        })
    }

    /// Record the tool response for this block. A block accepts exactly
    /// one response for its whole lifetime; the check reads the current
    /// database state, not this snapshot.
    pub fn respond(&self, tx: &Transaction, response: &str) -> Result<()> {
        self.write_response(tx, response, false)
    }

    /// Record an errored tool response (a mistake the agent can fix).
    pub fn respond_error(&self, tx: &Transaction, message: &str) -> Result<()> {
        self.write_response(tx, message, true)
    }

    fn write_response(&self, tx: &Transaction, response: &str, errored: bool) -> Result<()> {
        let existing: Option<String> = tx
            .query_row(
                "SELECT tool_response FROM block WHERE id = ?1",
                [self.id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if existing.is_some() {
            return Err(DbError::DuplicateResponse { block_id: self.id });
        }
        tx.execute(
            "UPDATE block SET tool_response = ?1, errored = ?2 WHERE id = ?3",
            params![response, errored, self.id],
        )?;
        Ok(())
    }

    /// Spawn a child conversation rooted at this block. Only an
    /// unresponded tool use may become a parent.
    pub fn start_conversation(&self, tx: &Transaction) -> Result<Conversation> {
        if self.tool_name.is_none() || self.tool_use_id.is_none() {
            return Err(DbError::Invariant(format!(
                "block {} is not a tool use, cannot start a conversation",
                self.id
            )));
        }
        let responded: Option<String> = tx
            .query_row(
                "SELECT tool_response FROM block WHERE id = ?1",
                [self.id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if responded.is_some() {
            return Err(DbError::Invariant(format!(
                "block {} already has a response, cannot start a conversation",
                self.id
            )));
        }
        Conversation::create(tx, Some(self.id))
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Block> {
        let create_time: String = row.get("create_time")?;
        let text_role: Option<String> = row.get("text_role")?;
        let text_role = match text_role.as_deref() {
            Some(raw) => Some(raw.parse::<TextRole>().map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "text_role".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?),
            None => None,
        };
        Ok(Block {
            id: row.get("id")?,
            conversation_id: row.get("conversation")?,
            create_time: parse_timestamp(&create_time).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "create_time".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            generation: row.get("generation")?,
            tool_name: row.get("tool_name")?,
            tool_use_id: row.get("tool_use_id")?,
            tool_params: row.get("tool_params")?,
            tool_response: row.get("tool_response")?,
            text_role,
            text_body: row.get("text_body")?,
            sent: row.get("sent")?,
            errored: row.get("errored")?,
        })
    }
}
