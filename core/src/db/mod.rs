//! SQLite persistence layer.
//!
//! Every durable mutation in the system goes through [`Store::with_tx`]:
//! a closure runs against an open transaction, a commit happens on `Ok`,
//! and the rollback happens automatically via `Drop` on `Err`. Transactions
//! are synchronous and must never be held across a network await; callers
//! snapshot what they need, drop the transaction, talk to the network, and
//! open a second transaction to apply the results.

pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction, TransactionBehavior};

/// Database module result type
pub type Result<T> = std::result::Result<T, DbError>;

/// Database error types
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("block {block_id} already has a tool response")]
    DuplicateResponse { block_id: i64 },

    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Owns the single SQLite connection.
///
/// The whole system is serialized through this store: one worker loop,
/// one connection, one transaction at a time. A mutex rather than a pool
/// keeps that serialization explicit.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `operation` inside a transaction, committing on `Ok`.
    ///
    /// Rollback on `Err` happens through the `Transaction` drop guard.
    pub fn with_tx<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| DbError::Transaction("connection mutex poisoned".to_string()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match operation(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }
}
