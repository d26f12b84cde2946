//! Schema initialization.
//!
//! All DDL is `IF NOT EXISTS` so opening an existing database is a no-op.

use rusqlite::Connection;

use super::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversation (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    previously TEXT,
    parent_block INTEGER REFERENCES block(id),
    total_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    current_tokens INTEGER NOT NULL DEFAULT 0,
    current_generation INTEGER NOT NULL DEFAULT 0,
    waiting_on_id TEXT
);

CREATE TABLE IF NOT EXISTS block (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation INTEGER NOT NULL REFERENCES conversation(id),
    create_time TEXT NOT NULL,
    generation INTEGER NOT NULL,
    tool_name TEXT,
    tool_use_id TEXT,
    tool_params TEXT,
    tool_response TEXT,
    text_role TEXT,
    text_body TEXT,
    sent INTEGER NOT NULL DEFAULT 0,
    errored INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_block_conversation_sent
    ON block(conversation, sent);
CREATE INDEX IF NOT EXISTS idx_block_tool_name
    ON block(tool_name);

CREATE TABLE IF NOT EXISTS chapter (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    text TEXT NOT NULL,
    conversation_id INTEGER REFERENCES conversation(id),
    chapter_summary_page_id INTEGER REFERENCES wiki_page(id)
);

CREATE TABLE IF NOT EXISTS wiki_page (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chapter INTEGER NOT NULL REFERENCES chapter(id),
    slug TEXT NOT NULL,
    create_time TEXT NOT NULL,
    create_block INTEGER NOT NULL REFERENCES block(id),
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wiki_page_slug_chapter
    ON wiki_page(slug, chapter);

CREATE TABLE IF NOT EXISTS wiki_name (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS wiki_page_name (
    wiki_page_id INTEGER NOT NULL REFERENCES wiki_page(id),
    wiki_name_id INTEGER NOT NULL REFERENCES wiki_name(id)
);

CREATE TABLE IF NOT EXISTS wiki_page_current (
    chapter INTEGER NOT NULL,
    slug TEXT NOT NULL,
    wiki_page INTEGER NOT NULL REFERENCES wiki_page(id),
    UNIQUE(chapter, slug)
);

CREATE TABLE IF NOT EXISTS prompt (
    key TEXT NOT NULL,
    create_time TEXT NOT NULL,
    create_block INTEGER NOT NULL REFERENCES block(id),
    summary TEXT NOT NULL,
    template TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompt_key_time
    ON prompt(key, create_time);

CREATE TABLE IF NOT EXISTS configuration (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
