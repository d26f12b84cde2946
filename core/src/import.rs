//! One-time chapter import.
//!
//! Chapters arrive as a JSON array of `{"name": [...], "text": "..."}`
//! records, in reading order. Import happens exactly once per database;
//! ids are assigned densely from 0 so chapter arithmetic stays simple.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::db::{DbError, Store};
use crate::models::Chapter;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("chapters have already been imported into this database")]
    AlreadyImported,

    #[error("invalid chapter file: {0}")]
    InvalidFormat(String),

    #[error("could not read chapter file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChapterRecord {
    name: Vec<String>,
    text: String,
}

pub fn import_chapters_from_file(store: &Store, path: impl AsRef<Path>) -> Result<usize, ImportError> {
    let json = std::fs::read_to_string(path)?;
    import_chapters(store, &json)
}

/// Parse and store the chapter list. Returns how many were imported.
pub fn import_chapters(store: &Store, json: &str) -> Result<usize, ImportError> {
    let records: Vec<ChapterRecord> = serde_json::from_str(json)
        .map_err(|e| ImportError::InvalidFormat(e.to_string()))?;
    if records.is_empty() {
        return Err(ImportError::InvalidFormat(
            "the file contains no chapters".to_string(),
        ));
    }
    for (index, record) in records.iter().enumerate() {
        if record.name.is_empty() {
            return Err(ImportError::InvalidFormat(format!(
                "chapter {index} has an empty name path"
            )));
        }
        if record.text.is_empty() {
            return Err(ImportError::InvalidFormat(format!(
                "chapter {index} has no text"
            )));
        }
    }

    let count = store.with_tx(|tx| {
        if Chapter::count(tx)? > 0 {
            // Mapped below; with_tx only carries database errors.
            return Err(DbError::Invariant("already imported".to_string()));
        }
        for (index, record) in records.iter().enumerate() {
            Chapter::create(tx, index as i64, &record.name, &record.text)?;
        }
        Ok(records.len())
    });
    match count {
        Ok(count) => {
            info!(chapters = count, "imported chapters");
            Ok(count)
        }
        Err(DbError::Invariant(_)) => Err(ImportError::AlreadyImported),
        Err(e) => Err(e.into()),
    }
}
