//! Durable state for cases, events, messages, attachments, confirmation
//! records, and mail tokens.
//!
//! The store exclusively owns persistence. Every state-mutating write on a
//! case happens inside a [`CaseLock`]: a writer transaction that re-reads the
//! case before handing it to the caller, so two concurrent callers targeting
//! the same case serialize. A busy database yields the skip sentinel
//! (`Ok(None)`) instead of blocking.

pub mod attachments;
pub mod cases;
pub mod events;
pub mod messages;
pub mod migration;
pub mod records;
pub mod tokens;

pub use migration::{ColumnCache, ensure_hash_indexes, run_migrations};

use crate::models::Case;
use rocket_db_pools::sqlx::{self, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("json encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("case '{0}' not found")]
    CaseNotFound(String),
    #[error("data integrity violation: {0}")]
    Integrity(String),
}

/// Handle over the single SQLite database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a per-case writer transaction and re-read the case inside it.
    ///
    /// Returns `Ok(None)` when the database reports BUSY: the caller must
    /// treat that as not-my-turn and skip, never spin. Dropping the returned
    /// guard without calling [`CaseLock::commit`] rolls the transaction back.
    pub async fn lock_case(&self, case_id: &str) -> Result<Option<CaseLock>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Self-assignment write promotes the transaction to a writer before
        // the in-lock re-read; a concurrent writer surfaces as SQLITE_BUSY.
        let promoted = sqlx::query("UPDATE cases SET touch_count = touch_count WHERE case_id = ?1")
            .bind(case_id)
            .execute(&mut *tx)
            .await;

        match promoted {
            Ok(result) if result.rows_affected() == 0 => {
                return Err(StoreError::CaseNotFound(case_id.to_string()));
            }
            Ok(_) => {}
            Err(err) if is_busy(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let case = cases::get_case_on(&mut tx, case_id)
            .await?
            .ok_or_else(|| StoreError::CaseNotFound(case_id.to_string()))?;

        Ok(Some(CaseLock { tx, case }))
    }
}

/// Exclusive writer lock over one case. All in-lock reads and writes go
/// through [`CaseLock::conn`].
pub struct CaseLock {
    tx: Transaction<'static, Sqlite>,
    /// Case row as read inside the lock.
    pub case: Case,
}

impl CaseLock {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Generated identifier with a short type prefix, e.g. `evt_2f1a…`.
pub(crate) fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// SQLITE_BUSY / SQLITE_LOCKED detection across sqlx error shapes.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code_is_busy = db_err
                .code()
                .map(|code| matches!(code.as_ref(), "5" | "6" | "261" | "517"))
                .unwrap_or(false);
            code_is_busy || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}
