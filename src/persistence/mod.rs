//! Persistence module for login history
//!
//! This module provides the login history consumed by detection and the
//! append-only attempt store that records every scored attempt.

pub mod cache;
pub mod sqlite_store;

pub use cache::{CachedHistoryStore, CountCache, InMemoryCountCache};
pub use sqlite_store::SqliteLoginStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::LoginAttempt;

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in database: {0}")]
    InvalidData(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("An attempt is already staged in this transaction")]
    AlreadyStaged,

    #[error("Nothing staged to commit")]
    NothingStaged,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Read side of the login history
///
/// Counts may be answered from a cache with a bounded freshness window;
/// implementations fall back to the source of truth on a miss.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Most recent attempts for a user created at or before `as_of`,
    /// newest first, at most `limit`
    async fn recent_attempts(
        &self,
        user_id: &str,
        limit: usize,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LoginAttempt>, PersistenceError>;

    /// Number of attempts by the user in `(as_of - window, as_of]`
    async fn count_in_window(
        &self,
        user_id: &str,
        window: chrono::Duration,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError>;

    /// Number of distinct IPs used by the user in `(as_of - window, as_of]`
    async fn count_distinct_ips_in_window(
        &self,
        user_id: &str,
        window: chrono::Duration,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError>;

    /// Bring any cached counts for the user up to date after a write
    async fn refresh(&self, _user_id: &str, _as_of: DateTime<Utc>) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Write side: hands out one transaction per detection run
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn AttemptTransaction>, PersistenceError>;
}

/// Transactional scope owned by a single in-flight detection
///
/// At most one attempt is staged. Nothing becomes visible to other
/// readers until `commit`; `rollback` (or dropping the transaction)
/// discards the staged attempt.
#[async_trait]
pub trait AttemptTransaction: Send {
    /// Most recent committed attempts for a user up to `as_of`, newest first
    async fn recent_attempts(
        &mut self,
        user_id: &str,
        limit: usize,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LoginAttempt>, PersistenceError>;

    /// Stage the fully populated attempt for writing
    fn append(&mut self, attempt: &LoginAttempt) -> Result<(), PersistenceError>;

    /// Write the staged attempt, returning its row id
    async fn commit(self: Box<Self>) -> Result<i64, PersistenceError>;

    /// Discard the staged attempt
    async fn rollback(self: Box<Self>);
}
