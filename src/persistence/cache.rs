//! Cache-first window counts
//!
//! Window counts are read on every detection, so they are served from a
//! short-lived cache and recomputed from the store on a miss or after a
//! new attempt is saved. Entries are keyed by the minute the window ends
//! in, so replayed attempts far apart in time never share a count.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{HistoryStore, PersistenceError};
use crate::models::LoginAttempt;

/// Key-value cache for integer counts with per-entry expiry
#[async_trait]
pub trait CountCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<u64>;
    async fn set(&self, key: &str, value: u64, ttl: Duration);
    async fn invalidate(&self, key: &str);
}

/// Process-local [`CountCache`]
#[derive(Default)]
pub struct InMemoryCountCache {
    entries: Mutex<HashMap<String, (u64, Instant)>>,
}

impl InMemoryCountCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }
}

#[async_trait]
impl CountCache for InMemoryCountCache {
    async fn get(&self, key: &str) -> Option<u64> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(*value),
            _ => None,
        }
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), (value, Instant::now() + ttl));
        }
    }

    async fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// Granularity of the window end in cache keys
const WINDOW_END_BUCKET_SECONDS: i64 = 60;

fn window_end_bucket(as_of: DateTime<Utc>) -> i64 {
    as_of.timestamp().div_euclid(WINDOW_END_BUCKET_SECONDS)
}

fn logins_key(user_id: &str, window: chrono::Duration, as_of: DateTime<Utc>) -> String {
    format!(
        "logins:last_{}m:{}:{}",
        window.num_minutes(),
        user_id,
        window_end_bucket(as_of)
    )
}

fn ips_key(user_id: &str, window: chrono::Duration, as_of: DateTime<Utc>) -> String {
    format!(
        "ips:last_{}m:{}:{}",
        window.num_minutes(),
        user_id,
        window_end_bucket(as_of)
    )
}

/// [`HistoryStore`] decorator that answers window counts from a cache
pub struct CachedHistoryStore {
    inner: Arc<dyn HistoryStore>,
    cache: Arc<dyn CountCache>,
    ttl: Duration,
    /// Windows recomputed by `refresh`
    warm_windows: Vec<chrono::Duration>,
}

impl CachedHistoryStore {
    pub fn new(
        inner: Arc<dyn HistoryStore>,
        cache: Arc<dyn CountCache>,
        ttl: Duration,
        warm_windows: Vec<chrono::Duration>,
    ) -> Self {
        CachedHistoryStore {
            inner,
            cache,
            ttl,
            warm_windows,
        }
    }
}

#[async_trait]
impl HistoryStore for CachedHistoryStore {
    async fn recent_attempts(
        &self,
        user_id: &str,
        limit: usize,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LoginAttempt>, PersistenceError> {
        self.inner.recent_attempts(user_id, limit, as_of, cancel).await
    }

    async fn count_in_window(
        &self,
        user_id: &str,
        window: chrono::Duration,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        let key = logins_key(user_id, window, as_of);
        if let Some(count) = self.cache.get(&key).await {
            return Ok(count);
        }
        let count = self.inner.count_in_window(user_id, window, as_of, cancel).await?;
        self.cache.set(&key, count, self.ttl).await;
        Ok(count)
    }

    async fn count_distinct_ips_in_window(
        &self,
        user_id: &str,
        window: chrono::Duration,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, PersistenceError> {
        let key = ips_key(user_id, window, as_of);
        if let Some(count) = self.cache.get(&key).await {
            return Ok(count);
        }
        let count = self
            .inner
            .count_distinct_ips_in_window(user_id, window, as_of, cancel)
            .await?;
        self.cache.set(&key, count, self.ttl).await;
        Ok(count)
    }

    async fn refresh(&self, user_id: &str, as_of: DateTime<Utc>) -> Result<(), PersistenceError> {
        let cancel = CancellationToken::new();
        for window in &self.warm_windows {
            let logins_key = logins_key(user_id, *window, as_of);
            let ips_key = ips_key(user_id, *window, as_of);
            self.cache.invalidate(&logins_key).await;
            self.cache.invalidate(&ips_key).await;

            let logins = self.inner.count_in_window(user_id, *window, as_of, &cancel).await?;
            let ips = self
                .inner
                .count_distinct_ips_in_window(user_id, *window, as_of, &cancel)
                .await?;
            self.cache.set(&logins_key, logins, self.ttl).await;
            self.cache.set(&ips_key, ips, self.ttl).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteLoginStore;
    use chrono::TimeZone;

    fn attempt(user: &str, ip: &str, at: DateTime<Utc>) -> LoginAttempt {
        LoginAttempt {
            id: None,
            user_id: user.to_string(),
            ip_address: ip.to_string(),
            device_id: "device-1".to_string(),
            location: String::new(),
            user_agent: String::new(),
            otp_code_hash: String::new(),
            success: true,
            distance_from_last: 0.0,
            risk_score: 0,
            device_mismatch: false,
            otp_replay_detected: false,
            login_frequency_high: false,
            multiple_ips_detected: false,
            is_phishing_risk: false,
            created_at: at,
        }
    }

    fn setup() -> (SqliteLoginStore, CachedHistoryStore) {
        let sqlite = SqliteLoginStore::in_memory().unwrap();
        let cached = CachedHistoryStore::new(
            Arc::new(sqlite.clone()),
            Arc::new(InMemoryCountCache::new()),
            Duration::from_secs(60),
            vec![chrono::Duration::minutes(60), chrono::Duration::minutes(30)],
        );
        (sqlite, cached)
    }

    #[tokio::test]
    async fn test_in_memory_cache_expiry() {
        let cache = InMemoryCountCache::new();
        cache.set("k", 3, Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some(3));

        cache.set("short", 1, Duration::from_millis(0)).await;
        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.purge_expired(), 1);

        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_miss_populates_and_hit_is_served_from_cache() {
        let (sqlite, cached) = setup();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let hour = chrono::Duration::minutes(60);
        let cancel = CancellationToken::new();

        sqlite.insert(&attempt("alice", "1.1.1.1", now)).unwrap();
        assert_eq!(cached.count_in_window("alice", hour, now, &cancel).await.unwrap(), 1);

        // New row bypasses the cache: cached value is still served
        sqlite.insert(&attempt("alice", "2.2.2.2", now)).unwrap();
        assert_eq!(cached.count_in_window("alice", hour, now, &cancel).await.unwrap(), 1);

        cached.refresh("alice", now).await.unwrap();
        assert_eq!(cached.count_in_window("alice", hour, now, &cancel).await.unwrap(), 2);
        assert_eq!(
            cached
                .count_distinct_ips_in_window("alice", hour, now, &cancel)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_counts_follow_the_attempt_time() {
        let (sqlite, cached) = setup();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let hour = chrono::Duration::minutes(60);
        let cancel = CancellationToken::new();

        for minutes in [5, 10, 15, 20, 25, 30] {
            sqlite
                .insert(&attempt("alice", "1.1.1.1", now - chrono::Duration::minutes(minutes)))
                .unwrap();
        }
        assert_eq!(cached.count_in_window("alice", hour, now, &cancel).await.unwrap(), 6);

        sqlite.insert(&attempt("alice", "1.1.1.1", now)).unwrap();
        cached.refresh("alice", now).await.unwrap();
        assert_eq!(cached.count_in_window("alice", hour, now, &cancel).await.unwrap(), 7);

        let next_day = now + chrono::Duration::days(1);
        assert_eq!(cached.count_in_window("alice", hour, next_day, &cancel).await.unwrap(), 0);
        assert_eq!(
            cached
                .count_distinct_ips_in_window("alice", hour, next_day, &cancel)
                .await
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_cache_keys() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 59).unwrap();
        let same_minute = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let next_minute = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();

        assert_eq!(
            logins_key("alice", chrono::Duration::minutes(60), at),
            format!("logins:last_60m:alice:{}", at.timestamp() / 60)
        );
        assert!(ips_key("bob", chrono::Duration::minutes(30), at).starts_with("ips:last_30m:bob:"));
        assert_eq!(
            logins_key("alice", chrono::Duration::minutes(60), at),
            logins_key("alice", chrono::Duration::minutes(60), same_minute)
        );
        assert_ne!(
            logins_key("alice", chrono::Duration::minutes(60), at),
            logins_key("alice", chrono::Duration::minutes(60), next_minute)
        );
    }
}
