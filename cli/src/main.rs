use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bookwiki_core::llm::openai::OpenAiService;
use bookwiki_core::models::{Block, Chapter, Conversation};
use bookwiki_core::{Processor, Store, Worker, WorkerStatus, import};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bookwiki", about = "Build a wiki for a book, one chapter at a time")]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long, default_value = "bookwiki.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import chapters from a JSON file. Happens once per database.
    Import {
        /// JSON array of {"name": [...], "text": "..."} records.
        chapters: PathBuf,
    },
    /// Process chapters until the book is done or ctrl-c.
    Run,
    /// Show how far processing has gotten.
    Status,
    /// List or answer pending expert feedback requests.
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommand,
    },
}

#[derive(Subcommand)]
enum FeedbackCommand {
    /// Show requests waiting for an answer.
    List,
    /// Answer a request; the agent sees it on its next turn.
    Answer { block_id: i64, response: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let store = Arc::new(
        Store::open(&cli.db).with_context(|| format!("opening database {}", cli.db.display()))?,
    );

    match cli.command {
        Command::Import { chapters } => {
            let count = import::import_chapters_from_file(&store, &chapters)
                .with_context(|| format!("importing {}", chapters.display()))?;
            println!("Imported {count} chapters.");
        }
        Command::Run => run(store).await?,
        Command::Status => status(&store)?,
        Command::Feedback { command } => feedback(&store, command)?,
    }
    Ok(())
}

async fn run(store: Arc<Store>) -> Result<()> {
    let api_key =
        std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set; put it in .env")?;
    let llm = Arc::new(OpenAiService::new(store.clone(), api_key));
    let worker = Worker::new(Processor::new(store, llm));
    worker.resume();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                info!("interrupted, shutting down");
                worker.kill();
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                match worker.status() {
                    WorkerStatus::Complete => {
                        println!("All chapters processed.");
                        worker.kill();
                        break;
                    }
                    WorkerStatus::Dead => bail!("worker exited unexpectedly"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn status(store: &Store) -> Result<()> {
    store.with_tx(|tx| {
        let total = Chapter::count(tx)?;
        match Chapter::get_latest_started(tx)? {
            Some(chapter) => println!(
                "Chapter {} of {total}: {}",
                chapter.id + 1,
                chapter.display_name()
            ),
            None => println!("No chapter started yet ({total} imported)."),
        }
        for (status, count) in Conversation::status_counts(tx)? {
            println!("{status}: {count}");
        }
        let pending = Block::unresponded_by_tool(tx, "RequestExpertFeedback")?;
        if !pending.is_empty() {
            println!("Pending expert feedback requests: {}", pending.len());
        }
        Ok(())
    })?;
    Ok(())
}

fn feedback(store: &Store, command: FeedbackCommand) -> Result<()> {
    match command {
        FeedbackCommand::List => {
            store.with_tx(|tx| {
                let pending = Block::unresponded_by_tool(tx, "RequestExpertFeedback")?;
                if pending.is_empty() {
                    println!("No pending requests.");
                }
                for block in pending {
                    let request = block
                        .tool_params
                        .as_deref()
                        .and_then(|params| serde_json::from_str::<serde_json::Value>(params).ok())
                        .and_then(|v| v.get("request").and_then(|r| r.as_str()).map(String::from))
                        .unwrap_or_else(|| "<unparseable request>".to_string());
                    println!("[{}] {request}", block.id);
                }
                Ok(())
            })?;
        }
        FeedbackCommand::Answer { block_id, response } => {
            store.with_tx(|tx| {
                let Some(block) = Block::get_by_id(tx, block_id)? else {
                    return Err(bookwiki_core::db::DbError::Invariant(format!(
                        "block {block_id} does not exist"
                    )));
                };
                block.respond(tx, &response)?;
                Ok(())
            })?;
            println!("Answered request {block_id}.");
        }
    }
    Ok(())
}
