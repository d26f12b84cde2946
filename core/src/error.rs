//! Crate-level error type.

use crate::db::DbError;
use crate::import::ImportError;
use crate::llm::LlmError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}
