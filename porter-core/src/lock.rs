//! Record mutex
//!
//! Cross-process mutual exclusion keyed by row identity. Two tasks
//! touching the same `(database, table, lock-column values)` serialize
//! fleet-wide; everything else proceeds in parallel. Held locks expire
//! so that a dead holder cannot wedge the key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{PorterError, Result};
use crate::event::Row;
use crate::rules::SyncRule;

/// Lock lease duration; covers holders that die without releasing
pub const LOCK_EXPIRY: Duration = Duration::from_secs(3);
/// Delay between acquisition attempts
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Attempts before the acquisition is abandoned
pub const LOCK_RETRY_COUNT: u32 = 32;

/// Fleet-shared lock state. One handle is shared by every process (or
/// stands in for the external store in tests and single-node runs).
pub trait LockStore: Send + Sync {
    /// Acquires `key` for `token` if free or expired. Returns false when
    /// another holder owns a live lease.
    fn try_acquire(&self, key: &str, token: u64, ttl: Duration) -> bool;

    /// Releases `key` if still held by `token`
    fn release(&self, key: &str, token: u64) -> Result<()>;
}

/// In-memory lock store with lease expiry
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current holder token, if the lease is live
    pub fn holder(&self, key: &str) -> Option<u64> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(token, _)| *token)
    }
}

impl LockStore for MemoryLockStore {
    fn try_acquire(&self, key: &str, token: u64, ttl: Duration) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        match entries.get(key) {
            Some((_, expires)) if *expires > now => false,
            _ => {
                entries.insert(key.to_string(), (token, now + ttl));
                true
            }
        }
    }

    fn release(&self, key: &str, token: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((holder, _)) if *holder == token => {
                entries.remove(key);
                Ok(())
            }
            Some(_) => Err(PorterError::Internal {
                message: format!("lock {key} no longer held by this worker"),
            }),
            // Lease already expired and was reclaimed
            None => Ok(()),
        }
    }
}

/// Builds record-lock keys and drives the retry loop
pub struct RecordLockManager {
    store: Arc<dyn LockStore>,
    next_token: AtomicU64,
}

impl RecordLockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            next_token: AtomicU64::new(1),
        }
    }

    /// Key format: `lock:<database>:<table>:<v1>_.._<vN>`. A lock column
    /// absent from the post-image contributes an empty string.
    pub fn lock_key(rule: &SyncRule, data: &Row) -> String {
        let values: Vec<&str> = rule
            .lock_columns
            .iter()
            .map(|column| data.get(column).map(String::as_str).unwrap_or(""))
            .collect();

        format!(
            "lock:{}:{}:{}",
            rule.database,
            rule.table,
            values.join("_")
        )
    }

    /// Acquires the key, retrying every 100 ms up to the retry budget.
    /// Acquisition deliberately ignores cancellation: by the time the
    /// process shuts down, lease expiry reclaims the key anyway.
    pub async fn lock(&self, key: &str) -> Result<RecordLockGuard> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        for attempt in 0..LOCK_RETRY_COUNT {
            if self.store.try_acquire(key, token, LOCK_EXPIRY) {
                return Ok(RecordLockGuard {
                    store: self.store.clone(),
                    key: key.to_string(),
                    token,
                });
            }
            if attempt + 1 < LOCK_RETRY_COUNT {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
        }

        Err(PorterError::LockUnavailable {
            key: key.to_string(),
        })
    }
}

/// Held record lock. Released on drop, on every exit path including
/// unwinds; release failures are logged and swallowed (expiry covers
/// them).
pub struct RecordLockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    token: u64,
}

impl std::fmt::Debug for RecordLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl Drop for RecordLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.release(&self.key, self.token) {
            warn!("record lock release failed for {}: {}", self.key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_with_locks(columns: &[&str]) -> SyncRule {
        let raw = format!(
            r#"{{"database":"shop","table":"users","primary_key":"id",
                "lock_columns":{},
                "columns":{{"id":"id"}},"target":"table:main.shop.users","sync_type":"copy"}}"#,
            serde_json::to_string(columns).unwrap()
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn test_lock_key_format() {
        let rule = rule_with_locks(&["id", "region"]);
        let mut data = Row::new();
        data.insert("id".into(), "7".into());
        data.insert("region".into(), "eu".into());

        assert_eq!(
            RecordLockManager::lock_key(&rule, &data),
            "lock:shop:users:7_eu"
        );
    }

    #[test]
    fn test_missing_lock_column_is_empty() {
        let rule = rule_with_locks(&["id", "region"]);
        let mut data = Row::new();
        data.insert("id".into(), "7".into());

        assert_eq!(
            RecordLockManager::lock_key(&rule, &data),
            "lock:shop:users:7_"
        );
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let store = MemoryLockStore::new();
        let manager = RecordLockManager::new(store.clone());

        let guard = manager.lock("lock:a:b:1").await.unwrap();
        assert!(!store.try_acquire("lock:a:b:1", 99, LOCK_EXPIRY));

        drop(guard);
        assert!(store.try_acquire("lock:a:b:1", 99, LOCK_EXPIRY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_lock_exhausts_budget() {
        let store = MemoryLockStore::new();
        // Hold the key with a lease far beyond the retry budget
        assert!(store.try_acquire("lock:a:b:1", 1, Duration::from_secs(60)));

        let manager = RecordLockManager::new(store.clone());
        let err = manager.lock("lock:a:b:1").await.unwrap_err();
        assert!(matches!(err, PorterError::LockUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimed() {
        let store = MemoryLockStore::new();
        assert!(store.try_acquire("lock:a:b:1", 1, Duration::from_millis(150)));

        let manager = RecordLockManager::new(store.clone());
        // The holder never releases; the retry loop wins once the lease
        // expires
        let guard = manager.lock("lock:a:b:1").await.unwrap();
        drop(guard);
    }
}
