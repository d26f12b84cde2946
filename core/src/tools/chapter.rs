//! Chapter reading.

use rusqlite::Transaction;
use schemars::JsonSchema;
use serde::Deserialize;

use super::ToolError;
use crate::models::{Block, Chapter};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadChapterParams {
    /// Offset from the current chapter: 0 or omitted for the current
    /// chapter, -1 for the one before it, and so on.
    pub chapter_offset: Option<i64>,
}

impl ReadChapterParams {
    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        let offset = self.chapter_offset.unwrap_or(0);
        if offset > 0 {
            return Err(ToolError::Solvable(
                "Cannot read future chapters. Use a chapter_offset of zero or less.".to_string(),
            ));
        }
        let current = Chapter::get_latest_started(tx)?.ok_or_else(|| {
            ToolError::Solvable("No chapter has been started yet.".to_string())
        })?;
        let target_id = current.id + offset;
        let chapter = Chapter::get_by_id(tx, target_id)?.ok_or_else(|| {
            ToolError::Solvable(format!("Chapter at offset {offset} does not exist."))
        })?;

        let response = format!("**{}**\n\n{}", chapter.display_name(), chapter.text);
        block.respond(tx, &response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Store;
    use crate::models::Conversation;

    fn seed(tx: &Transaction) -> crate::db::Result<Block> {
        let conv = Conversation::create(tx, None)?;
        Block::create_tool_use(tx, conv.id, 0, "ReadChapter", "use_1", "{}")
    }

    #[test]
    fn reads_current_and_earlier_chapters() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let c0 = Chapter::create(tx, 0, &["Chapter 1".into()], "In a hole in the ground")?;
                let c1 = Chapter::create(tx, 1, &["Chapter 2".into()], "Roast mutton")?;
                let conv = Conversation::create(tx, None)?;
                c0.start(tx, conv.id)?;
                let conv = Conversation::create(tx, None)?;
                c1.start(tx, conv.id)?;

                let block = seed(tx)?;
                ReadChapterParams {
                    chapter_offset: None,
                }
                .apply(tx, &block).unwrap();
                let block = Block::get_by_id(tx, block.id)?.unwrap();
                assert_eq!(
                    block.tool_response.as_deref(),
                    Some("**Chapter 2**\n\nRoast mutton")
                );

                let block = seed(tx)?;
                ReadChapterParams {
                    chapter_offset: Some(-1),
                }
                .apply(tx, &block).unwrap();
                let block = Block::get_by_id(tx, block.id)?.unwrap();
                assert_eq!(
                    block.tool_response.as_deref(),
                    Some("**Chapter 1**\n\nIn a hole in the ground")
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn future_chapters_are_refused() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let c0 = Chapter::create(tx, 0, &["Chapter 1".into()], "text")?;
                let conv = Conversation::create(tx, None)?;
                c0.start(tx, conv.id)?;

                let block = seed(tx)?;
                let err = ReadChapterParams {
                    chapter_offset: Some(1),
                }
                .apply(tx, &block)
                .unwrap_err();
                assert!(matches!(err, ToolError::Solvable(msg) if msg.contains("future")));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn out_of_range_offset_is_solvable() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let c0 = Chapter::create(tx, 0, &["Chapter 1".into()], "text")?;
                let conv = Conversation::create(tx, None)?;
                c0.start(tx, conv.id)?;

                let block = seed(tx)?;
                let err = ReadChapterParams {
                    chapter_offset: Some(-5),
                }
                .apply(tx, &block)
                .unwrap_err();
                assert!(matches!(err, ToolError::Solvable(_)));
                Ok(())
            })
            .unwrap();
    }
}
