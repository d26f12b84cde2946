//! Durable orchestration for a wiki-building agent.
//!
//! Chapters of a book are processed strictly in order by a tool-using
//! agent. All state lives in SQLite: conversations, their blocks, the
//! versioned wiki, stored prompt templates, and configuration. The process
//! can be killed at any point and resumed without losing work, because the
//! only coordination primitive is the database itself.

pub mod config_types;
pub mod db;
pub mod error;
pub mod import;
pub mod links;
pub mod llm;
pub mod models;
pub mod processor;
pub mod search;
pub mod template;
pub mod tools;
pub mod worker;

pub use db::Store;
pub use error::{Error, Result};
pub use processor::Processor;
pub use worker::{Worker, WorkerStatus};
