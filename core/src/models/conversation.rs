//! Conversations: ordered block sequences exchanged with the LLM.

use rusqlite::{OptionalExtension, Row, Transaction, params};
use strum_macros::Display;
use tracing::debug;

use super::block::{Block, TextRole};
use crate::db::{DbError, Result};

/// Derived processing state. Never stored; always computed from the
/// waiting marker and the block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConversationStatus {
    #[strum(serialize = "Waiting LLM")]
    WaitingLlm,
    #[strum(serialize = "Waiting Tools")]
    WaitingTools,
    #[strum(serialize = "Ready")]
    Unsent,
    #[strum(serialize = "Finished")]
    Finished,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    /// Opaque provider continuation handle (previous response id).
    pub previously: Option<String>,
    pub parent_block_id: Option<i64>,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub current_tokens: i64,
    pub current_generation: i64,
    pub waiting_on_id: Option<String>,
}

impl Conversation {
    pub fn create(tx: &Transaction, parent_block_id: Option<i64>) -> Result<Conversation> {
        tx.execute(
            "INSERT INTO conversation (previously, parent_block, total_input_tokens,
             total_output_tokens, current_tokens, current_generation, waiting_on_id)
             VALUES (NULL, ?1, 0, 0, 0, 0, NULL)",
            params![parent_block_id],
        )?;
        let id = tx.last_insert_rowid();
        debug!(conversation = id, parent_block = ?parent_block_id, "created conversation");
        Ok(Conversation {
            id,
            previously: None,
            parent_block_id,
            total_input_tokens: 0,
            total_output_tokens: 0,
            current_tokens: 0,
            current_generation: 0,
            waiting_on_id: None,
        })
    }

    pub fn get_by_id(tx: &Transaction, conversation_id: i64) -> Result<Option<Conversation>> {
        tx.query_row(
            "SELECT * FROM conversation WHERE id = ?1",
            [conversation_id],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn get_by_parent_block(tx: &Transaction, parent_block_id: i64) -> Result<Option<Conversation>> {
        tx.query_row(
            "SELECT * FROM conversation WHERE parent_block = ?1",
            [parent_block_id],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// The lowest-id conversation that is ready to submit: at least one
    /// unsent block, no unsent tool use without a response, and not
    /// already waiting on the LLM.
    pub fn find_sendable(tx: &Transaction) -> Result<Option<Conversation>> {
        tx.query_row(
            "SELECT c.* FROM conversation c
             WHERE EXISTS (
                 SELECT 1 FROM block b
                 WHERE b.conversation = c.id AND b.sent = 0
             )
             AND NOT EXISTS (
                 SELECT 1 FROM block b
                 WHERE b.conversation = c.id
                 AND b.sent = 0
                 AND b.tool_name IS NOT NULL
                 AND b.tool_response IS NULL
             )
             AND c.waiting_on_id IS NULL
             ORDER BY c.id
             LIMIT 1",
            [],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Next conversation with an outstanding LLM request, optionally
    /// skipping ids at or below `after_id` so callers can walk the set.
    pub fn find_waiting(tx: &Transaction, after_id: Option<i64>) -> Result<Option<Conversation>> {
        tx.query_row(
            "SELECT * FROM conversation
             WHERE waiting_on_id IS NOT NULL AND id > ?1
             ORDER BY id
             LIMIT 1",
            [after_id.unwrap_or(-1)],
            Self::from_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// True when no conversation has unsent blocks or an outstanding
    /// LLM request.
    pub fn all_finished(tx: &Transaction) -> Result<bool> {
        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM conversation c
             WHERE EXISTS (
                 SELECT 1 FROM block b
                 WHERE b.conversation = c.id AND b.sent = 0
             )
             OR c.waiting_on_id IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(active == 0)
    }

    pub fn update_tokens(&self, tx: &Transaction, input_tokens: i64, output_tokens: i64) -> Result<()> {
        tx.execute(
            "UPDATE conversation
             SET total_input_tokens = total_input_tokens + ?1,
                 total_output_tokens = total_output_tokens + ?2,
                 current_tokens = ?3
             WHERE id = ?4",
            params![input_tokens, output_tokens, input_tokens + output_tokens, self.id],
        )?;
        Ok(())
    }

    pub fn set_waiting_on_id(&self, tx: &Transaction, value: Option<&str>) -> Result<()> {
        match value {
            Some(id) => debug!(conversation = self.id, response = id, "waiting on response"),
            None => debug!(conversation = self.id, "cleared waiting status"),
        }
        tx.execute(
            "UPDATE conversation SET waiting_on_id = ?1 WHERE id = ?2",
            params![value, self.id],
        )?;
        Ok(())
    }

    pub fn update_previously(&self, tx: &Transaction, value: &str) -> Result<()> {
        tx.execute(
            "UPDATE conversation SET previously = ?1 WHERE id = ?2",
            params![value, self.id],
        )?;
        Ok(())
    }

    /// Bump the generation and return the refreshed row.
    pub fn increment_generation(&self, tx: &Transaction) -> Result<Conversation> {
        tx.execute(
            "UPDATE conversation SET current_generation = current_generation + 1
             WHERE id = ?1",
            [self.id],
        )?;
        Self::get_by_id(tx, self.id)?.ok_or_else(|| {
            DbError::Invariant(format!("conversation {} disappeared after update", self.id))
        })
    }

    pub fn mark_all_blocks_sent(&self, tx: &Transaction) -> Result<()> {
        tx.execute(
            "UPDATE block SET sent = 1 WHERE conversation = ?1 AND sent = 0",
            [self.id],
        )?;
        Ok(())
    }

    pub fn add_tool_use(&self, tx: &Transaction, name: &str, use_id: &str, params_json: &str) -> Result<Block> {
        Block::create_tool_use(tx, self.id, self.current_generation, name, use_id, params_json)
    }

    /// Assistant text arrives already sent: it came from the LLM.
    pub fn add_assistant_text(&self, tx: &Transaction, text: &str) -> Result<Block> {
        Block::create_text(tx, self.id, self.current_generation, TextRole::Assistant, text, true)
    }

    pub fn add_user_text(&self, tx: &Transaction, text: &str) -> Result<Block> {
        Block::create_text(tx, self.id, self.current_generation, TextRole::User, text, false)
    }

    pub fn blocks(&self, tx: &Transaction) -> Result<Vec<Block>> {
        let mut stmt =
            tx.prepare("SELECT * FROM block WHERE conversation = ?1 ORDER BY id")?;
        let blocks = stmt
            .query_map([self.id], Block::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    pub fn unsent_blocks(&self, tx: &Transaction) -> Result<Vec<Block>> {
        let mut stmt = tx
            .prepare("SELECT * FROM block WHERE conversation = ?1 AND sent = 0 ORDER BY id")?;
        let blocks = stmt
            .query_map([self.id], Block::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(blocks)
    }

    pub fn parent_block(&self, tx: &Transaction) -> Result<Option<Block>> {
        match self.parent_block_id {
            Some(id) => Block::get_by_id(tx, id),
            None => Ok(None),
        }
    }

    pub fn status(&self, tx: &Transaction) -> Result<ConversationStatus> {
        if self.waiting_on_id.is_some() {
            return Ok(ConversationStatus::WaitingLlm);
        }

        let has_unsent: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM block WHERE conversation = ?1 AND sent = 0 LIMIT 1",
                [self.id],
                |row| row.get(0),
            )
            .optional()?;
        if has_unsent.is_none() {
            return Ok(ConversationStatus::Finished);
        }

        let waiting_tools: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM block
                 WHERE conversation = ?1
                 AND sent = 0
                 AND tool_name IS NOT NULL
                 AND tool_response IS NULL
                 LIMIT 1",
                [self.id],
                |row| row.get(0),
            )
            .optional()?;
        if waiting_tools.is_some() {
            return Ok(ConversationStatus::WaitingTools);
        }

        Ok(ConversationStatus::Unsent)
    }

    /// Counts of conversations by derived status, for status reporting.
    pub fn status_counts(tx: &Transaction) -> Result<Vec<(ConversationStatus, usize)>> {
        let mut stmt = tx.prepare("SELECT * FROM conversation ORDER BY id")?;
        let conversations = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut waiting_llm = 0;
        let mut waiting_tools = 0;
        let mut unsent = 0;
        let mut finished = 0;
        for conv in &conversations {
            match conv.status(tx)? {
                ConversationStatus::WaitingLlm => waiting_llm += 1,
                ConversationStatus::WaitingTools => waiting_tools += 1,
                ConversationStatus::Unsent => unsent += 1,
                ConversationStatus::Finished => finished += 1,
            }
        }
        Ok(vec![
            (ConversationStatus::WaitingLlm, waiting_llm),
            (ConversationStatus::WaitingTools, waiting_tools),
            (ConversationStatus::Unsent, unsent),
            (ConversationStatus::Finished, finished),
        ])
    }

    /// True when the last two generations each contain exactly one tool
    /// use and it is the same tool both times. The agent is probably
    /// issuing calls one at a time that could run in parallel.
    pub fn detect_serial_tool_use(&self, tx: &Transaction) -> Result<bool> {
        let mut stmt = tx.prepare(
            "SELECT tool_name, generation, COUNT(*) as count
             FROM block
             WHERE conversation = ?1
             AND generation >= ?2
             AND tool_name IS NOT NULL
             GROUP BY tool_name, generation",
        )?;
        let rows = stmt
            .query_map(params![self.id, self.current_generation - 1], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows.len() == 2
            && rows[0].2 == 1
            && rows[1].2 == 1
            && rows[0].0 == rows[1].0
            && rows[0].1 != rows[1].1)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
        Ok(Conversation {
            id: row.get("id")?,
            previously: row.get("previously")?,
            parent_block_id: row.get("parent_block")?,
            total_input_tokens: row.get("total_input_tokens")?,
            total_output_tokens: row.get("total_output_tokens")?,
            current_tokens: row.get("current_tokens")?,
            current_generation: row.get("current_generation")?,
            waiting_on_id: row.get("waiting_on_id")?,
        })
    }
}
