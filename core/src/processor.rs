//! The turn engine.
//!
//! A turn has two database phases with the network strictly between
//! them: a snapshot transaction collects everything the provider needs,
//! then the await happens with no transaction open, then an apply
//! transaction folds the result back in. Crashing between the phases is
//! always safe; the worst case is resubmitting a turn.

use std::sync::Arc;

use rusqlite::Transaction;
use tracing::{info, warn};

use crate::db::{DbError, Store};
use crate::error::Result;
use crate::llm::{InputItem, LlmError, LlmResponse, LlmService, PromptRequest};
use crate::models::{Block, Chapter, Configuration, Conversation, TextRole, WikiPage};
use crate::tools;

/// Slug the agent must write before a chapter can finish.
pub const CHAPTER_SUMMARY_SLUG: &str = "chapter-summary";

const COMPRESS_SYSTEM_MESSAGE: &str = "You are an intelligent agent helping another agent.";

const MISSING_SUMMARY_NUDGE: &str = "You must create a wiki page with the slug 'chapter-summary' \
     that summarizes the key events, characters, and plot developments from this chapter.";

const PARALLEL_TOOLS_NUDGE: &str = "For better performance, consider using multiple tool calls \
     in parallel if they don't depend on each other.";

pub struct Processor {
    store: Arc<Store>,
    llm: Arc<dyn LlmService>,
}

struct SendSnapshot {
    conversation_id: i64,
    previously: Option<String>,
    input: Vec<InputItem>,
    system_message: Option<String>,
    compressing: bool,
}

impl Processor {
    pub fn new(store: Arc<Store>, llm: Arc<dyn LlmService>) -> Self {
        Self { store, llm }
    }

    /// Submit every conversation that is ready to go, lowest id first.
    pub async fn process_sendable(&self) -> Result<()> {
        loop {
            let Some(snapshot) = self.store.with_tx(snapshot_sendable)? else {
                return Ok(());
            };
            let conversation_id = snapshot.conversation_id;
            let request = PromptRequest {
                previously: snapshot.previously,
                input: snapshot.input,
                system_message: snapshot.system_message,
                compressing: snapshot.compressing,
            };
            match self.llm.prompt(request).await {
                Ok(response_id) => {
                    self.store.with_tx(|tx| {
                        let conv = require_conversation(tx, conversation_id)?;
                        conv.set_waiting_on_id(tx, Some(&response_id))
                    })?;
                }
                Err(e @ (LlmError::NonRetryable(_) | LlmError::MalformedInput(_))) => {
                    return Err(e.into());
                }
                Err(e) => {
                    // Blocks stay unsent, so the next pass resubmits.
                    warn!(conversation = conversation_id, error = %e, "submit failed, will retry later");
                    return Ok(());
                }
            }
        }
    }

    /// Poll every conversation with an outstanding response and fold in
    /// whatever has finished.
    pub async fn process_waiting(&self) -> Result<()> {
        let mut last_id = None;
        loop {
            let Some(conv) = self
                .store
                .with_tx(|tx| Conversation::find_waiting(tx, last_id))?
            else {
                return Ok(());
            };
            last_id = Some(conv.id);
            let Some(response_id) = conv.waiting_on_id.clone() else {
                continue;
            };
            match self.llm.try_fetch(&response_id).await {
                Ok(None) => {}
                Ok(Some(response)) => self.store.with_tx(|tx| fold_in(tx, conv.id, response))?,
                Err(LlmError::Retryable(reason)) => {
                    warn!(conversation = conv.id, %reason, "response must be resubmitted");
                    self.store.with_tx(|tx| {
                        let conv = require_conversation(tx, conv.id)?;
                        conv.set_waiting_on_id(tx, None)
                    })?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Start the next chapter once everything in flight has settled.
    /// Returns false when the whole book has been processed.
    pub async fn advance_chapter_if_needed(&self) -> Result<bool> {
        let advanced = self.store.with_tx(|tx| {
            if !Conversation::all_finished(tx)? {
                return Ok(true);
            }
            let Some(chapter) = Chapter::find_first_unstarted(tx)? else {
                return Ok(false);
            };
            let conv = Conversation::create(tx, None)?;
            chapter.start(tx, conv.id)?;
            let prompt = Configuration::chapter_prompt(tx)?;
            conv.add_user_text(tx, &prompt)?;
            info!(chapter = chapter.id, conversation = conv.id, "advanced to next chapter");
            Ok(true)
        })?;
        Ok(advanced)
    }
}

fn require_conversation(tx: &Transaction, id: i64) -> crate::db::Result<Conversation> {
    Conversation::get_by_id(tx, id)?
        .ok_or_else(|| DbError::Invariant(format!("conversation {id} disappeared")))
}

/// Find the next sendable conversation and capture its request. Also
/// appends the compression prompt when the conversation has outgrown
/// the threshold, so the snapshot includes it.
fn snapshot_sendable(tx: &Transaction) -> crate::db::Result<Option<SendSnapshot>> {
    let Some(conv) = Conversation::find_sendable(tx)? else {
        return Ok(None);
    };
    let threshold = Configuration::openai_compression_threshold(tx)?;
    let compressing = conv.current_tokens > threshold;
    let system_message = if compressing {
        let prompt = Configuration::compress_prompt(tx)?;
        // A failed submit leaves the appended prompt behind; do not
        // append a second copy on the retry.
        let already_appended = conv
            .unsent_blocks(tx)?
            .last()
            .is_some_and(|b| b.text_body.as_deref() == Some(prompt.as_str()));
        if !already_appended {
            info!(
                conversation = conv.id,
                tokens = conv.current_tokens,
                threshold,
                "conversation over threshold, compressing"
            );
            conv.add_user_text(tx, &prompt)?;
        }
        Some(COMPRESS_SYSTEM_MESSAGE.to_string())
    } else {
        None
    };

    let mut input = Vec::new();
    for block in conv.unsent_blocks(tx)? {
        input.push(input_item(&block)?);
    }
    Ok(Some(SendSnapshot {
        conversation_id: conv.id,
        previously: conv.previously.clone(),
        input,
        system_message,
        compressing,
    }))
}

fn input_item(block: &Block) -> crate::db::Result<InputItem> {
    if let Some(use_id) = &block.tool_use_id {
        let output = block.tool_response.clone().ok_or_else(|| {
            DbError::Invariant(format!("sendable tool block {} has no response", block.id))
        })?;
        return Ok(InputItem::ToolOutput {
            call_id: use_id.clone(),
            output,
        });
    }
    if block.text_role == Some(TextRole::User) {
        return Ok(InputItem::UserText(block.text_body.clone().unwrap_or_default()));
    }
    Err(DbError::Invariant(format!(
        "block {} cannot be sent as input",
        block.id
    )))
}

/// Apply one completed response to its conversation.
fn fold_in(tx: &Transaction, conversation_id: i64, response: LlmResponse) -> crate::db::Result<()> {
    let conv = require_conversation(tx, conversation_id)?;
    let conv = conv.increment_generation(tx)?;
    conv.set_waiting_on_id(tx, None)?;
    conv.mark_all_blocks_sent(tx)?;
    conv.update_tokens(tx, response.input_tokens, response.output_tokens)?;
    conv.update_previously(tx, &response.updated_previously)?;

    if response.compressing {
        // The summary becomes fresh user input for the next turn.
        for text in &response.texts {
            conv.add_user_text(tx, text)?;
        }
        return Ok(());
    }

    let mut last_assistant_block = None;
    for text in &response.texts {
        last_assistant_block = Some(conv.add_assistant_text(tx, text)?);
    }

    for tool_use in &response.tool_uses {
        let block = conv.add_tool_use(tx, &tool_use.name, &tool_use.id, &tool_use.arguments)?;
        tools::apply(tx, &block, &tool_use.call)?;
    }

    if conv.detect_serial_tool_use(tx)? {
        conv.add_user_text(tx, PARALLEL_TOOLS_NUDGE)?;
    }

    if response.tool_uses.is_empty() {
        // No tool calls means the conversation is wrapping up.
        match conv.parent_block(tx)? {
            Some(parent) => {
                parent.respond(tx, &response.texts.join("\n\n"))?;
            }
            None => finalize_chapter(tx, &conv, last_assistant_block)?,
        }
    }
    Ok(())
}

/// A root conversation produced its final message. Collect the chapter
/// summary page and retire it from the wiki, or nudge the agent if the
/// page was never written.
fn finalize_chapter(
    tx: &Transaction,
    conv: &Conversation,
    last_assistant_block: Option<Block>,
) -> crate::db::Result<()> {
    let Some(chapter) = Chapter::get_by_conversation(tx, conv.id)? else {
        return Err(DbError::Invariant(format!(
            "root conversation {} has no chapter",
            conv.id
        )));
    };
    let Some(summary_page) = WikiPage::read_page_at(tx, CHAPTER_SUMMARY_SLUG, chapter.id)? else {
        info!(chapter = chapter.id, "chapter summary missing, nudging agent");
        conv.add_user_text(tx, MISSING_SUMMARY_NUDGE)?;
        return Ok(());
    };
    let Some(block) = last_assistant_block else {
        return Err(DbError::Invariant(format!(
            "conversation {} finished without assistant text",
            conv.id
        )));
    };
    chapter.set_chapter_summary_page(tx, summary_page.id)?;
    summary_page.delete_and_redirect(tx, block.id, chapter.id, "")?;
    info!(chapter = chapter.id, page = summary_page.id, "chapter finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::llm::Result as LlmResult;
    use crate::models::ConversationStatus;

    /// Scripted provider: records prompts, hands out queued responses.
    #[derive(Default)]
    struct ScriptedLlm {
        prompts: Mutex<Vec<PromptRequest>>,
        prompt_errors: Mutex<VecDeque<LlmError>>,
        fetches: Mutex<VecDeque<LlmResult<Option<LlmResponse>>>>,
        counter: AtomicU64,
    }

    impl ScriptedLlm {
        fn queue(&self, result: LlmResult<Option<LlmResponse>>) {
            self.fetches.lock().unwrap().push_back(result);
        }

        fn fail_next_prompt(&self, error: LlmError) {
            self.prompt_errors.lock().unwrap().push_back(error);
        }

        fn prompts(&self) -> Vec<PromptRequest> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl LlmService for ScriptedLlm {
        async fn prompt(&self, request: PromptRequest) -> LlmResult<String> {
            self.prompts.lock().unwrap().push(request);
            if let Some(error) = self.prompt_errors.lock().unwrap().pop_front() {
                return Err(error);
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("resp_{n}"))
        }

        async fn try_fetch(&self, _response_id: &str) -> LlmResult<Option<LlmResponse>> {
            self.fetches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    fn text_response(texts: &[&str]) -> LlmResponse {
        LlmResponse {
            texts: texts.iter().map(|t| t.to_string()).collect(),
            tool_uses: vec![],
            input_tokens: 100,
            output_tokens: 25,
            compressing: false,
            updated_previously: "resp_done".to_string(),
        }
    }

    fn setup() -> (Arc<Store>, Arc<ScriptedLlm>, Processor) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let llm = Arc::new(ScriptedLlm::default());
        let processor = Processor::new(store.clone(), llm.clone());
        (store, llm, processor)
    }

    fn seed_chapter(store: &Store) -> i64 {
        store
            .with_tx(|tx| {
                Chapter::create(tx, 0, &["Chapter 1".into()], "Once upon a time")?;
                Ok(())
            })
            .unwrap();
        0
    }

    #[tokio::test]
    async fn advancing_starts_the_first_chapter() {
        let (store, _llm, processor) = setup();
        seed_chapter(&store);

        assert!(processor.advance_chapter_if_needed().await.unwrap());
        store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                assert_eq!(conv.status(tx)?, ConversationStatus::Unsent);
                let blocks = conv.blocks(tx)?;
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].text_role, Some(TextRole::User));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn advancing_with_no_chapters_left_reports_complete() {
        let (_store, _llm, processor) = setup();
        assert!(!processor.advance_chapter_if_needed().await.unwrap());
    }

    #[tokio::test]
    async fn sendable_conversations_get_submitted() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();

        processor.process_sendable().await.unwrap();
        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(!prompts[0].compressing);
        assert!(prompts[0].previously.is_none());
        assert_eq!(prompts[0].input.len(), 1);

        store
            .with_tx(|tx| {
                let conv = Conversation::find_waiting(tx, None)?.unwrap();
                assert_eq!(conv.waiting_on_id.as_deref(), Some("resp_0"));
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn tool_calls_are_applied_and_resubmitted() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();
        processor.process_sendable().await.unwrap();

        let read = tools::parse_tool_use("ReadChapter", "call_1", "{\"chapter_offset\": null}")
            .unwrap();
        llm.queue(Ok(Some(LlmResponse {
            texts: vec!["Let me read the chapter.".to_string()],
            tool_uses: vec![read],
            input_tokens: 50,
            output_tokens: 10,
            compressing: false,
            updated_previously: "resp_0".to_string(),
        })));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                assert_eq!(conv.current_generation, 1);
                assert_eq!(conv.current_tokens, 60);
                assert_eq!(conv.previously.as_deref(), Some("resp_0"));
                // The tool ran inside the same transaction.
                let blocks = conv.blocks(tx)?;
                let tool = blocks.iter().find(|b| b.tool_name.is_some()).unwrap();
                assert_eq!(
                    tool.tool_response.as_deref(),
                    Some("**Chapter 1**\n\nOnce upon a time")
                );
                // Responded tool use makes the conversation sendable again.
                assert_eq!(conv.status(tx)?, ConversationStatus::Unsent);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn finishing_without_summary_page_nudges() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();
        processor.process_sendable().await.unwrap();

        llm.queue(Ok(Some(text_response(&["All done with this chapter."]))));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                assert!(chapter.chapter_summary_page_id.is_none());
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                let blocks = conv.blocks(tx)?;
                let nudge = blocks.last().unwrap();
                assert_eq!(nudge.text_role, Some(TextRole::User));
                assert!(nudge.text_body.as_deref().unwrap().contains("chapter-summary"));
                assert!(!nudge.sent);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn finishing_with_summary_page_collects_and_retires_it() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();
        processor.process_sendable().await.unwrap();

        // The agent writes the summary page mid-conversation.
        store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                let block = Block::create_tool_use(tx, conv.id, 0, "WriteWikiPage", "w1", "{}")?;
                WikiPage::create(
                    tx,
                    block.id,
                    0,
                    CHAPTER_SUMMARY_SLUG,
                    "Chapter 1 Summary",
                    &["Chapter 1 Summary".to_string()],
                    "What happened.",
                    "A quiet beginning.",
                )?;
                block.respond(tx, "Wrote wiki page 'chapter-summary'.")?;
                Ok(())
            })
            .unwrap();

        llm.queue(Ok(Some(text_response(&["Chapter complete."]))));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                assert!(chapter.chapter_summary_page_id.is_some());
                // Retired from the live wiki.
                assert!(WikiPage::read_page_at(tx, CHAPTER_SUMMARY_SLUG, 0)?.is_none());
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                assert_eq!(conv.status(tx)?, ConversationStatus::Finished);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn compression_turn_replaces_context_with_user_summary() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();

        store
            .with_tx(|tx| {
                Configuration::set(tx, "openai_compression_threshold", "1000")?;
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                conv.update_tokens(tx, 900, 200)?;
                Ok(())
            })
            .unwrap();

        processor.process_sendable().await.unwrap();
        let prompts = llm.prompts();
        assert!(prompts[0].compressing);
        assert_eq!(
            prompts[0].system_message.as_deref(),
            Some(COMPRESS_SYSTEM_MESSAGE)
        );
        // Chapter prompt plus the appended compression prompt.
        assert_eq!(prompts[0].input.len(), 2);

        llm.queue(Ok(Some(LlmResponse {
            texts: vec!["Summary of everything so far.".to_string()],
            tool_uses: vec![],
            input_tokens: 10,
            output_tokens: 5,
            compressing: true,
            updated_previously: "resp_0".to_string(),
        })));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                // The summary came back as unsent user text, ready to send.
                assert_eq!(conv.status(tx)?, ConversationStatus::Unsent);
                let blocks = conv.blocks(tx)?;
                let last = blocks.last().unwrap();
                assert_eq!(last.text_role, Some(TextRole::User));
                assert_eq!(
                    last.text_body.as_deref(),
                    Some("Summary of everything so far.")
                );
                assert!(!last.sent);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn compression_prompt_is_not_duplicated_across_failed_submits() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();

        store
            .with_tx(|tx| {
                Configuration::set(tx, "openai_compression_threshold", "1000")?;
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                conv.update_tokens(tx, 900, 200)?;
                Ok(())
            })
            .unwrap();

        // Two transient submit failures, then a clean submit.
        llm.fail_next_prompt(LlmError::Retryable("overloaded".to_string()));
        processor.process_sendable().await.unwrap();
        llm.fail_next_prompt(LlmError::Retryable("overloaded".to_string()));
        processor.process_sendable().await.unwrap();
        processor.process_sendable().await.unwrap();

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[2].compressing);
        // Chapter prompt plus one copy of the compression prompt.
        assert_eq!(prompts[2].input.len(), 2);

        store
            .with_tx(|tx| {
                let compress_prompt = Configuration::compress_prompt(tx)?;
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                let copies = conv
                    .blocks(tx)?
                    .iter()
                    .filter(|b| b.text_body.as_deref() == Some(compress_prompt.as_str()))
                    .count();
                assert_eq!(copies, 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn serial_tool_use_draws_a_nudge() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();
        processor.process_sendable().await.unwrap();

        let first = tools::parse_tool_use("ReadChapter", "c1", "{\"chapter_offset\": null}").unwrap();
        llm.queue(Ok(Some(LlmResponse {
            texts: vec![],
            tool_uses: vec![first],
            input_tokens: 1,
            output_tokens: 1,
            compressing: false,
            updated_previously: "resp_0".to_string(),
        })));
        processor.process_waiting().await.unwrap();
        processor.process_sendable().await.unwrap();

        let second = tools::parse_tool_use("ReadChapter", "c2", "{\"chapter_offset\": null}").unwrap();
        llm.queue(Ok(Some(LlmResponse {
            texts: vec![],
            tool_uses: vec![second],
            input_tokens: 1,
            output_tokens: 1,
            compressing: false,
            updated_previously: "resp_1".to_string(),
        })));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                let blocks = conv.blocks(tx)?;
                let nudges: Vec<_> = blocks
                    .iter()
                    .filter(|b| b.text_body.as_deref() == Some(PARALLEL_TOOLS_NUDGE))
                    .collect();
                assert_eq!(nudges.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn child_conversations_answer_their_parent_block() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();

        let (parent_block_id, child_id) = store
            .with_tx(|tx| {
                let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
                let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
                let block = Block::create_tool_use(tx, conv.id, 0, "SpawnAgent", "s1", "{}")?;
                let child = block.start_conversation(tx)?;
                child.add_user_text(tx, "Investigate the Ring")?;
                Ok((block.id, child.id))
            })
            .unwrap();

        // Parent is blocked on the tool; only the child is sendable.
        processor.process_sendable().await.unwrap();
        assert_eq!(llm.prompts().len(), 1);

        llm.queue(Ok(Some(text_response(&["It is the One Ring."]))));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let parent_block = Block::get_by_id(tx, parent_block_id)?.unwrap();
                assert_eq!(
                    parent_block.tool_response.as_deref(),
                    Some("It is the One Ring.")
                );
                let child = Conversation::get_by_id(tx, child_id)?.unwrap();
                assert_eq!(child.status(tx)?, ConversationStatus::Finished);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn retryable_fetch_failures_clear_the_waiting_marker() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();
        processor.process_sendable().await.unwrap();

        llm.queue(Err(LlmError::Retryable("cancelled".to_string())));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let conv = Conversation::find_sendable(tx)?.unwrap();
                assert!(conv.waiting_on_id.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn pending_responses_leave_state_untouched() {
        let (store, llm, processor) = setup();
        seed_chapter(&store);
        processor.advance_chapter_if_needed().await.unwrap();
        processor.process_sendable().await.unwrap();

        llm.queue(Ok(None));
        processor.process_waiting().await.unwrap();

        store
            .with_tx(|tx| {
                let conv = Conversation::find_waiting(tx, None)?.unwrap();
                assert_eq!(conv.waiting_on_id.as_deref(), Some("resp_0"));
                assert!(!Conversation::all_finished(tx)?);
                Ok(())
            })
            .unwrap();
    }
}
