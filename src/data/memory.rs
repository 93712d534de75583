//! In-process named data store with a condvar-backed advisory lock.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::clock;
use crate::error::{Result, SyncError};

use super::models::NamedRecord;
use super::store::{AdvisoryLockBackend, DataStore};

struct HeldLock {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl HeldLock {
    fn is_free_for(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder || self.expires_at <= now
    }
}

#[derive(Default)]
pub struct InMemoryDataStore {
    records: Mutex<HashMap<String, NamedRecord>>,
    locks: Mutex<HashMap<String, HeldLock>>,
    released: Condvar,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, NamedRecord>>> {
        self.records
            .lock()
            .map_err(|_| SyncError::Persistence("in-memory data store lock poisoned".to_string()))
    }

    fn locks(&self) -> Result<MutexGuard<'_, HashMap<String, HeldLock>>> {
        self.locks
            .lock()
            .map_err(|_| SyncError::Persistence("in-memory lock table poisoned".to_string()))
    }

    fn take_if_free(
        locks: &mut HashMap<String, HeldLock>,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> bool {
        let now = clock::now();
        if locks.get(key).is_some_and(|held| !held.is_free_for(holder, now)) {
            return false;
        }
        locks.insert(
            key.to_string(),
            HeldLock {
                holder: holder.to_string(),
                expires_at: clock::expires_at(now, ttl),
            },
        );
        true
    }
}

impl DataStore for InMemoryDataStore {
    fn get(&self, name: &str) -> Result<Option<NamedRecord>> {
        let now = clock::now();
        Ok(self
            .records()?
            .get(name)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    fn set(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| clock::expires_at(clock::now(), ttl));
        self.records()?.insert(
            name.to_string(),
            NamedRecord::new(name, value.clone(), expires_at),
        );
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.records()?.remove(name).is_some())
    }

    fn insert_if_absent(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
        let now = clock::now();
        let mut records = self.records()?;
        if records.get(name).is_some_and(|r| !r.is_expired(now)) {
            return Ok(false);
        }
        let expires_at = ttl.map(|ttl| clock::expires_at(now, ttl));
        records.insert(
            name.to_string(),
            NamedRecord::new(name, value.clone(), expires_at),
        );
        Ok(true)
    }

    fn compare_and_delete(&self, name: &str, expected: &Value) -> Result<bool> {
        let mut records = self.records()?;
        if records.get(name).is_some_and(|r| &r.value == expected) {
            records.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        let mut removed = (before - records.len()) as u64;
        drop(records);

        let mut locks = self.locks()?;
        let before = locks.len();
        locks.retain(|_, held| held.expires_at > now);
        removed += (before - locks.len()) as u64;
        Ok(removed)
    }
}

impl AdvisoryLockBackend for InMemoryDataStore {
    fn try_advisory_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks()?;
        Ok(Self::take_if_free(&mut locks, key, holder, ttl))
    }

    fn advisory_unlock(&self, key: &str, holder: &str) -> Result<bool> {
        let mut locks = self.locks()?;
        if locks.get(key).is_some_and(|held| held.holder == holder) {
            locks.remove(key);
            self.released.notify_all();
            return Ok(true);
        }
        Ok(false)
    }

    fn advisory_lock(&self, key: &str, holder: &str, ttl: Duration, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;
        let mut locks = self.locks()?;
        loop {
            if Self::take_if_free(&mut locks, key, holder, ttl) {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            // Expiry is not signalled, so wake no later than the holder's TTL.
            let until_expiry = locks
                .get(key)
                .and_then(|held| (held.expires_at - clock::now()).to_std().ok())
                .unwrap_or(remaining);
            let (guard, _) = self
                .released
                .wait_timeout(locks, remaining.min(until_expiry))
                .map_err(|_| SyncError::Persistence("in-memory lock table poisoned".to_string()))?;
            locks = guard;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    /// Behaviour every [`DataStore`] must share.
    pub(crate) fn assert_data_store_contract(store: &dyn DataStore) {
        assert!(store.get("feed/run-1").expect("get missing").is_none());

        store
            .set("feed/run-1", &json!({"pages": [1]}), None)
            .expect("set");
        let record = store.get("feed/run-1").expect("get").expect("present");
        assert_eq!(record.value, json!({"pages": [1]}));
        assert_eq!(record.expires_at, None);

        assert!(!store
            .insert_if_absent("feed/run-1", &json!("other"), None)
            .expect("insert over live record"));
        assert!(!store
            .compare_and_delete("feed/run-1", &json!({"pages": [2]}))
            .expect("cad mismatch"));
        assert!(store
            .compare_and_delete("feed/run-1", &json!({"pages": [1]}))
            .expect("cad match"));
        assert!(store.get("feed/run-1").expect("get deleted").is_none());

        store
            .set("short-lived", &json!(1), Some(Duration::ZERO))
            .expect("set expired");
        assert!(store.get("short-lived").expect("get expired").is_none());
        assert!(store
            .insert_if_absent("short-lived", &json!(2), Some(Duration::from_secs(60)))
            .expect("insert over expired record"));
        let record = store.get("short-lived").expect("get").expect("present");
        assert_eq!(record.value, json!(2));
        assert!(record.expires_at.is_some());

        store
            .set("gone", &json!(true), Some(Duration::ZERO))
            .expect("set");
        let purged = store.purge_expired(clock::now()).expect("purge");
        assert!(purged >= 1);
        assert!(store.get("short-lived").expect("survivor").is_some());

        assert!(store.delete("short-lived").expect("delete"));
        assert!(!store.delete("short-lived").expect("delete again"));
    }

    /// Behaviour every [`AdvisoryLockBackend`] must share.
    pub(crate) fn assert_advisory_lock_contract(backend: &dyn AdvisoryLockBackend) {
        let ttl = Duration::from_secs(30);
        assert!(backend.try_advisory_lock("k_lock", "a", ttl).expect("lock a"));
        assert!(!backend.try_advisory_lock("k_lock", "b", ttl).expect("lock b"));
        assert!(backend.try_advisory_lock("k_lock", "a", ttl).expect("re-enter a"));
        assert!(!backend
            .advisory_lock("k_lock", "b", ttl, Duration::from_millis(50))
            .expect("bounded wait"));
        assert!(!backend.advisory_unlock("k_lock", "b").expect("unlock by stranger"));
        assert!(backend.advisory_unlock("k_lock", "a").expect("unlock a"));
        assert!(backend.try_advisory_lock("k_lock", "b", ttl).expect("lock b after"));
        assert!(backend.advisory_unlock("k_lock", "b").expect("unlock b"));

        assert!(backend
            .try_advisory_lock("stale_lock", "a", Duration::ZERO)
            .expect("stale lock"));
        assert!(backend
            .try_advisory_lock("stale_lock", "b", ttl)
            .expect("take over expired lock"));
        assert!(backend.advisory_unlock("stale_lock", "b").expect("unlock"));
    }

    #[test]
    fn in_memory_store_honours_data_store_contract() {
        assert_data_store_contract(&InMemoryDataStore::new());
    }

    #[test]
    fn in_memory_store_honours_advisory_lock_contract() {
        assert_advisory_lock_contract(&InMemoryDataStore::new());
    }

    #[test]
    fn blocked_waiter_wakes_when_holder_releases() {
        let store = Arc::new(InMemoryDataStore::new());
        let ttl = Duration::from_secs(30);
        assert!(store.try_advisory_lock("k_lock", "a", ttl).expect("lock"));

        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || {
                store
                    .advisory_lock("k_lock", "b", ttl, Duration::from_secs(5))
                    .expect("wait")
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.advisory_unlock("k_lock", "a").expect("unlock"));
        assert!(waiter.join().expect("join waiter"));
    }
}
