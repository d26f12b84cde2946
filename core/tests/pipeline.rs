//! End-to-end pipeline tests with a scripted provider.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bookwiki_core::Processor;
use bookwiki_core::Store;
use bookwiki_core::import::import_chapters;
use bookwiki_core::llm::{LlmResponse, LlmService, PromptRequest, Result as LlmResult};
use bookwiki_core::models::{Chapter, Conversation, ConversationStatus, WikiPage};
use bookwiki_core::tools;
use pretty_assertions::assert_eq;

#[derive(Default)]
struct ScriptedLlm {
    fetches: Mutex<VecDeque<LlmResponse>>,
    counter: AtomicU64,
}

impl ScriptedLlm {
    fn queue(&self, response: LlmResponse) {
        self.fetches.lock().unwrap().push_back(response);
    }
}

#[async_trait::async_trait]
impl LlmService for ScriptedLlm {
    async fn prompt(&self, _request: PromptRequest) -> LlmResult<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("resp_{n}"))
    }

    async fn try_fetch(&self, _response_id: &str) -> LlmResult<Option<LlmResponse>> {
        Ok(self.fetches.lock().unwrap().pop_front())
    }
}

fn response(texts: &[&str], tool_uses: Vec<tools::ToolUse>, previously: &str) -> LlmResponse {
    LlmResponse {
        texts: texts.iter().map(|t| t.to_string()).collect(),
        tool_uses,
        input_tokens: 100,
        output_tokens: 30,
        compressing: false,
        updated_previously: previously.to_string(),
    }
}

fn setup(chapters_json: &str) -> (Arc<Store>, Arc<ScriptedLlm>, Processor) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    import_chapters(&store, chapters_json).unwrap();
    let llm = Arc::new(ScriptedLlm::default());
    let processor = Processor::new(store.clone(), llm.clone());
    (store, llm, processor)
}

const TWO_CHAPTERS: &str = r#"[
    {"name": ["Chapter 1"], "text": "A hobbit finds a ring."},
    {"name": ["Chapter 2"], "text": "The hobbit leaves home."}
]"#;

#[tokio::test]
async fn a_chapter_flows_from_prompt_to_summary_collection() {
    let (store, llm, processor) = setup(TWO_CHAPTERS);

    // Cycle 1: the first chapter starts and its prompt is submitted.
    assert!(processor.advance_chapter_if_needed().await.unwrap());
    processor.process_sendable().await.unwrap();

    // The agent writes a character page and the chapter summary.
    let write_page = tools::parse_tool_use(
        "WriteWikiPage",
        "call_1",
        r#"{"slug": "bilbo", "title": "Bilbo", "names": ["Bilbo"],
            "summary": "A hobbit.", "body": "Finds a ring.", "create": true,
            "delete_and_redirect_to": null}"#,
    )
    .unwrap();
    let write_summary = tools::parse_tool_use(
        "WriteWikiPage",
        "call_2",
        r#"{"slug": "chapter-summary", "title": "Chapter 1 Summary",
            "names": ["Chapter 1 Summary"], "summary": "What happened.",
            "body": "[Bilbo](bilbo) finds a ring.", "create": true,
            "delete_and_redirect_to": null}"#,
    )
    .unwrap();
    llm.queue(response(
        &["Updating the wiki."],
        vec![write_page, write_summary],
        "resp_0",
    ));
    processor.process_waiting().await.unwrap();
    processor.process_sendable().await.unwrap();

    // The agent finishes; the summary page gets collected and retired.
    llm.queue(response(&["Chapter 1 is done."], vec![], "resp_1"));
    processor.process_waiting().await.unwrap();

    store
        .with_tx(|tx| {
            let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
            let summary_id = chapter.chapter_summary_page_id.unwrap();
            let summary = WikiPage::get_by_id(tx, summary_id)?.unwrap();
            assert_eq!(summary.title, "Chapter 1 Summary");

            // Retired from the live wiki, so only the character page is left.
            assert_eq!(WikiPage::get_all_slugs(tx, 0)?, vec!["bilbo"]);

            let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
            assert_eq!(conv.status(tx)?, ConversationStatus::Finished);
            assert_eq!(conv.total_input_tokens, 200);
            assert_eq!(conv.total_output_tokens, 60);
            assert_eq!(conv.previously.as_deref(), Some("resp_1"));
            Ok(())
        })
        .unwrap();

    // Cycle 2: with everything settled, the next chapter starts and
    // inherits the surviving wiki pages.
    assert!(processor.advance_chapter_if_needed().await.unwrap());
    store
        .with_tx(|tx| {
            let chapter = Chapter::get_by_id(tx, 1)?.unwrap();
            assert!(chapter.conversation_id.is_some());
            assert_eq!(WikiPage::get_all_slugs(tx, 1)?, vec!["bilbo"]);
            assert!(WikiPage::read_page_at(tx, "chapter-summary", 1)?.is_none());
            Ok(())
        })
        .unwrap();

    // After the last chapter there is nothing left to start.
    store
        .with_tx(|tx| {
            let chapter = Chapter::get_by_id(tx, 1)?.unwrap();
            let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
            conv.mark_all_blocks_sent(tx)?;
            Ok(())
        })
        .unwrap();
    assert!(!processor.advance_chapter_if_needed().await.unwrap());
}

#[tokio::test]
async fn solvable_tool_mistakes_come_back_as_errored_responses() {
    let (store, llm, processor) = setup(TWO_CHAPTERS);
    processor.advance_chapter_if_needed().await.unwrap();
    processor.process_sendable().await.unwrap();

    let bad_read = tools::parse_tool_use("ReadWikiPage", "call_1", r#"{"slug": "nowhere"}"#).unwrap();
    llm.queue(response(&[], vec![bad_read], "resp_0"));
    processor.process_waiting().await.unwrap();

    store
        .with_tx(|tx| {
            let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
            let conv = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
            let blocks = conv.blocks(tx)?;
            let tool = blocks.iter().find(|b| b.tool_name.is_some()).unwrap();
            assert!(tool.errored);
            assert!(
                tool.tool_response
                    .as_deref()
                    .unwrap()
                    .contains("'nowhere' does not exist")
            );
            // The errored response still counts as answered, so the
            // conversation can be resubmitted for the agent to recover.
            assert_eq!(conv.status(tx)?, ConversationStatus::Unsent);
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn a_spawned_agent_reports_back_to_its_parent() {
    let (store, llm, processor) = setup(TWO_CHAPTERS);
    processor.advance_chapter_if_needed().await.unwrap();
    processor.process_sendable().await.unwrap();

    // The agent stores a prompt and spawns a sub-agent from it.
    let store_prompt = tools::parse_tool_use(
        "WritePrompt",
        "call_1",
        r#"{"key": "investigate", "summary": "Investigate a topic",
            "template": "Investigate $topic and report back."}"#,
    )
    .unwrap();
    llm.queue(response(&[], vec![store_prompt], "resp_0"));
    processor.process_waiting().await.unwrap();
    processor.process_sendable().await.unwrap();

    let spawn = tools::parse_tool_use(
        "SpawnAgent",
        "call_2",
        r#"{"prompt_key": "investigate", "template_names": ["topic"],
            "template_values": ["the ring"]}"#,
    )
    .unwrap();
    llm.queue(response(&[], vec![spawn], "resp_1"));
    processor.process_waiting().await.unwrap();

    // The parent now waits on its SpawnAgent block; only the child sends.
    processor.process_sendable().await.unwrap();
    store
        .with_tx(|tx| {
            let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
            let parent = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
            assert_eq!(parent.status(tx)?, ConversationStatus::WaitingTools);
            Ok(())
        })
        .unwrap();

    llm.queue(response(&["The ring is magical."], vec![], "resp_2"));
    processor.process_waiting().await.unwrap();

    store
        .with_tx(|tx| {
            let chapter = Chapter::get_by_id(tx, 0)?.unwrap();
            let parent = Conversation::get_by_id(tx, chapter.conversation_id.unwrap())?.unwrap();
            // The child's answer landed on the SpawnAgent block, so the
            // parent is ready to continue.
            assert_eq!(parent.status(tx)?, ConversationStatus::Unsent);
            let blocks = parent.blocks(tx)?;
            let spawn_block = blocks
                .iter()
                .find(|b| b.tool_name.as_deref() == Some("SpawnAgent"))
                .unwrap();
            assert_eq!(
                spawn_block.tool_response.as_deref(),
                Some("The ring is magical.")
            );
            Ok(())
        })
        .unwrap();
}
