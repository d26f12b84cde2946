//! Persistent domain model.
//!
//! Model types are plain data. Every read and mutation takes an explicit
//! `&Transaction` and rereads whatever it needs; nothing caches derived
//! state across transaction boundaries.

pub mod block;
pub mod chapter;
pub mod configuration;
pub mod conversation;
pub mod prompt;
pub mod wikipage;

pub use block::{Block, TextRole};
pub use chapter::Chapter;
pub use configuration::Configuration;
pub use conversation::{Conversation, ConversationStatus};
pub use prompt::Prompt;
pub use wikipage::WikiPage;

use chrono::{DateTime, Utc};

use crate::db::{DbError, Result};

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Invariant(format!("unparseable timestamp '{value}': {e}")))
}
