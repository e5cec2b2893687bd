//! SQLite implementation of the history and attempt stores

use super::{AttemptStore, AttemptTransaction, HistoryStore, PersistenceError};
use crate::models::LoginAttempt;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

const ATTEMPT_COLUMNS: &str = "id, user_id, ip_address, device_id, location, user_agent, \
     otp_code_hash, success, distance_from_last, risk_score, device_mismatch, \
     otp_replay_detected, login_frequency_high, multiple_ips_detected, is_phishing_risk, created_at";

/// SQLite-based login history
///
/// Attempts are only ever inserted; maintenance removes whole rows past
/// the retention horizon.
#[derive(Clone)]
pub struct SqliteLoginStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLoginStore {
    /// Create a new SQLite store at the specified path
    ///
    /// Creates the database file and initializes the schema if it doesn't exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path)?;
        let store = SqliteLoginStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteLoginStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Insert an attempt outside of a detection transaction
    ///
    /// Used for importing history; detection writes go through [`AttemptStore::begin`].
    pub fn insert(&self, attempt: &LoginAttempt) -> Result<i64, PersistenceError> {
        let conn = lock(&self.conn)?;
        insert_attempt(&conn, attempt)
    }

    /// Most recent attempts flagged as phishing risk, across all users
    pub fn recent_flagged(&self, limit: usize) -> Result<Vec<LoginAttempt>, PersistenceError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM login_attempts
             WHERE is_phishing_risk = 1
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
            ATTEMPT_COLUMNS
        ))?;

        let attempts = stmt
            .query_map(params![limit as i64], row_to_attempt)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(attempts)
    }

    /// Remove attempts created before `before`
    ///
    /// This is used to prevent unbounded growth of the database
    pub fn prune_older_than(&self, before: DateTime<Utc>) -> Result<usize, PersistenceError> {
        let conn = lock(&self.conn)?;
        let deleted = conn.execute(
            "DELETE FROM login_attempts WHERE created_at < ?",
            params![before.timestamp_millis()],
        )?;
        Ok(deleted)
    }

    /// Total number of stored attempts
    pub fn count_all(&self) -> Result<u64, PersistenceError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM login_attempts", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Clear all data (useful for testing)
    pub fn clear_all(&self) -> Result<(), PersistenceError> {
        let conn = lock(&self.conn)?;
        conn.execute_batch("DELETE FROM login_attempts;")?;
        Ok(())
    }

    /// Run `query` against the connection on the blocking pool
    async fn blocking<T, F>(&self, query: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.conn), query).await
    }

    async fn query_count(
        &self,
        sql: &'static str,
        user_id: &str,
        window: chrono::Duration,
        as_of: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let user_id = user_id.to_string();
        let start = (as_of - window).timestamp_millis();
        let end = as_of.timestamp_millis();
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(sql, params![user_id, start, end], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, query: F) -> Result<T, PersistenceError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let guard = lock(&conn)?;
        query(&guard)
    })
    .await?
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
    conn.lock().map_err(|_| PersistenceError::LockPoisoned)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PersistenceError> {
    if cancel.is_cancelled() {
        Err(PersistenceError::Cancelled)
    } else {
        Ok(())
    }
}

fn select_recent(
    conn: &Connection,
    user_id: &str,
    limit: usize,
    as_of: DateTime<Utc>,
) -> Result<Vec<LoginAttempt>, PersistenceError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM login_attempts
         WHERE user_id = ? AND created_at <= ?
         ORDER BY created_at DESC, id DESC
         LIMIT ?",
        ATTEMPT_COLUMNS
    ))?;

    let attempts = stmt
        .query_map(params![user_id, as_of.timestamp_millis(), limit as i64], row_to_attempt)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(attempts)
}

fn insert_attempt(conn: &Connection, attempt: &LoginAttempt) -> Result<i64, PersistenceError> {
    conn.execute(
        "INSERT INTO login_attempts
         (user_id, ip_address, device_id, location, user_agent, otp_code_hash, success,
          distance_from_last, risk_score, device_mismatch, otp_replay_detected,
          login_frequency_high, multiple_ips_detected, is_phishing_risk, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            attempt.user_id,
            attempt.ip_address,
            attempt.device_id,
            attempt.location,
            attempt.user_agent,
            attempt.otp_code_hash,
            attempt.success,
            attempt.distance_from_last,
            attempt.risk_score,
            attempt.device_mismatch,
            attempt.otp_replay_detected,
            attempt.login_frequency_high,
            attempt.multiple_ips_detected,
            attempt.is_phishing_risk,
            attempt.created_at.timestamp_millis(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<LoginAttempt> {
    let created_ms: i64 = row.get(15)?;
    let created_at = Utc.timestamp_millis_opt(created_ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            15,
            rusqlite::types::Type::Integer,
            format!("invalid timestamp {}", created_ms).into(),
        )
    })?;

    Ok(LoginAttempt {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        ip_address: row.get(2)?,
        device_id: row.get(3)?,
        location: row.get(4)?,
        user_agent: row.get(5)?,
        otp_code_hash: row.get(6)?,
        success: row.get(7)?,
        distance_from_last: row.get(8)?,
        risk_score: row.get(9)?,
        device_mismatch: row.get(10)?,
        otp_replay_detected: row.get(11)?,
        login_frequency_high: row.get(12)?,
        multiple_ips_detected: row.get(13)?,
        is_phishing_risk: row.get(14)?,
        created_at,
    })
}

#[async_trait]
impl HistoryStore for SqliteLoginStore {
    async fn recent_attempts(
        &self,
        user_id: &str,
        limit: usize,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LoginAttempt>, PersistenceError> {
        check_cancelled(cancel)?;
        let user_id = user_id.to_string();
        self.blocking(move |conn| select_recent(conn, &user_id, limit, as_of)).await
    }

    async fn count_in_window(
        &self,
        user_id: &str,
        window: chrono::Duration,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        check_cancelled(cancel)?;
        self.query_count(
            "SELECT COUNT(*) FROM login_attempts
             WHERE user_id = ? AND created_at > ? AND created_at <= ?",
            user_id,
            window,
            as_of,
        )
        .await
    }

    async fn count_distinct_ips_in_window(
        &self,
        user_id: &str,
        window: chrono::Duration,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        check_cancelled(cancel)?;
        self.query_count(
            "SELECT COUNT(DISTINCT ip_address) FROM login_attempts
             WHERE user_id = ? AND created_at > ? AND created_at <= ?",
            user_id,
            window,
            as_of,
        )
        .await
    }
}

#[async_trait]
impl AttemptStore for SqliteLoginStore {
    async fn begin(&self) -> Result<Box<dyn AttemptTransaction>, PersistenceError> {
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            staged: None,
        }))
    }
}

/// Detection-scoped transaction over the SQLite store
///
/// The staged attempt is written inside a single SQLite transaction on
/// commit, so a failed or abandoned run leaves no row behind.
pub struct SqliteTransaction {
    conn: Arc<Mutex<Connection>>,
    staged: Option<LoginAttempt>,
}

impl SqliteTransaction {
    fn write_staged(conn: &Mutex<Connection>, attempt: &LoginAttempt) -> Result<i64, PersistenceError> {
        let mut conn = lock(conn)?;
        let tx = conn.transaction()?;
        let id = insert_attempt(&tx, attempt)?;
        tx.commit()?;
        Ok(id)
    }
}

#[async_trait]
impl AttemptTransaction for SqliteTransaction {
    async fn recent_attempts(
        &mut self,
        user_id: &str,
        limit: usize,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LoginAttempt>, PersistenceError> {
        check_cancelled(cancel)?;
        let user_id = user_id.to_string();
        run_blocking(Arc::clone(&self.conn), move |conn| {
            select_recent(conn, &user_id, limit, as_of)
        })
        .await
    }

    fn append(&mut self, attempt: &LoginAttempt) -> Result<(), PersistenceError> {
        if self.staged.is_some() {
            return Err(PersistenceError::AlreadyStaged);
        }
        self.staged = Some(attempt.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<i64, PersistenceError> {
        let SqliteTransaction { conn, staged } = *self;
        let attempt = staged.ok_or(PersistenceError::NothingStaged)?;
        tokio::task::spawn_blocking(move || Self::write_staged(&conn, &attempt)).await?
    }

    async fn rollback(self: Box<Self>) {
        if let Some(attempt) = &self.staged {
            log::debug!("Discarding staged attempt for user {}", attempt.user_id);
        }
    }
}
