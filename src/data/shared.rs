//! Run-scoped shared state with merge-on-write updates.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::merge::merge;

use super::key::{lock_key, normalize_key};
use super::lock::{KeyedLock, LockGuard, PollingLock};
use super::store::DataStore;

/// Named values shared between workers. Read-modify-write goes through
/// [`SharedState::update_merged`], which serialises writers per name.
#[derive(Clone)]
pub struct SharedState {
    store: Arc<dyn DataStore>,
    lock: Arc<dyn KeyedLock>,
    max_key_len: usize,
}

impl SharedState {
    pub fn new(store: Arc<dyn DataStore>, lock: Arc<dyn KeyedLock>, max_key_len: usize) -> Self {
        Self {
            store,
            lock,
            max_key_len,
        }
    }

    /// Shared state locked by polling lock records in the same store.
    pub fn with_polling_lock(store: Arc<dyn DataStore>, config: &SyncConfig) -> Self {
        let lock = Arc::new(PollingLock::from_config(store.clone(), config));
        Self::new(store, lock, config.max_key_len)
    }

    fn key(&self, name: &str) -> String {
        normalize_key(name, self.max_key_len)
    }

    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.store.get(&self.key(name))?.map(|r| r.value))
    }

    pub fn set(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        self.store.set(&self.key(name), value, ttl)
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.store.delete(&self.key(name))
    }

    /// Merges `updates` into the value stored under `name` while holding the
    /// lock `{name}_lock`, and returns the written value.
    ///
    /// Fails with [`crate::SyncError::LockTimeout`] without writing when the
    /// lock cannot be taken. The lock is released on every path.
    pub fn update_merged(
        &self,
        name: &str,
        updates: &Value,
        deep_merge: bool,
        concat_arrays: bool,
        ttl: Option<Duration>,
    ) -> Result<Value> {
        let key = self.key(name);
        let guard = LockGuard::acquire(self.lock.as_ref(), &lock_key(name, self.max_key_len))?;

        let current = match self.store.get(&key)? {
            Some(record) => record.value,
            None => empty_like(updates),
        };
        let merged = merge(&current, updates, deep_merge, concat_arrays);
        self.store.set(&key, &merged, ttl)?;
        debug!("merged update into '{}'", name);

        // The write has landed; a failed release only delays other writers
        // until the lock record's TTL runs out.
        if let Err(err) = guard.release() {
            warn!("failed to release lock for '{}': {}", name, err);
        }
        Ok(merged)
    }
}

fn empty_like(value: &Value) -> Value {
    match value {
        Value::Array(_) => Value::Array(Vec::new()),
        _ => Value::Object(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use serde_json::json;

    use crate::data::lock::{Backoff, LockToken};
    use crate::data::memory::InMemoryDataStore;
    use crate::data::models::NamedRecord;
    use crate::error::SyncError;

    use super::*;

    fn shared() -> (SharedState, Arc<dyn DataStore>) {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let lock = Arc::new(PollingLock::new(
            store.clone(),
            Duration::from_secs(30),
            Backoff {
                initial: Duration::from_millis(5),
                jitter: 0.08,
                budget: Duration::from_millis(50),
            },
        ));
        (SharedState::new(store.clone(), lock, 64), store)
    }

    #[test]
    fn update_merged_starts_from_empty_and_accumulates() {
        let (state, store) = shared();
        state
            .update_merged("feed/run-1/pending", &json!({"items": [1, 2]}), true, true, None)
            .expect("first update");
        let merged = state
            .update_merged(
                "feed/run-1/pending",
                &json!({"items": [3], "page": 2}),
                true,
                true,
                None,
            )
            .expect("second update");
        assert_eq!(merged, json!({"items": [1, 2, 3], "page": 2}));
        assert_eq!(state.get("feed/run-1/pending").expect("get"), Some(merged));
        assert!(store
            .get("feed/run-1/pending_lock")
            .expect("lock record")
            .is_none());
    }

    #[test]
    fn lock_timeout_leaves_value_untouched() {
        let (state, store) = shared();
        state
            .set("counter", &json!({"n": 1}), None)
            .expect("seed");
        store
            .set("counter_lock", &json!({"holder": "someone-else"}), None)
            .expect("foreign lock");

        let err = state
            .update_merged("counter", &json!({"n": 2}), false, false, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { .. }));
        assert_eq!(state.get("counter").expect("get"), Some(json!({"n": 1})));
    }

    /// Delegates to an in-memory store but refuses every `set`.
    struct RejectingWrites(InMemoryDataStore);

    impl DataStore for RejectingWrites {
        fn get(&self, name: &str) -> Result<Option<NamedRecord>> {
            self.0.get(name)
        }
        fn set(&self, _name: &str, _value: &Value, _ttl: Option<Duration>) -> Result<()> {
            Err(SyncError::Persistence("write rejected".into()))
        }
        fn delete(&self, name: &str) -> Result<bool> {
            self.0.delete(name)
        }
        fn insert_if_absent(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
            self.0.insert_if_absent(name, value, ttl)
        }
        fn compare_and_delete(&self, name: &str, expected: &Value) -> Result<bool> {
            self.0.compare_and_delete(name, expected)
        }
        fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            self.0.purge_expired(now)
        }
    }

    /// Grants every acquisition but fails every release.
    struct UnreleasableLock;

    impl KeyedLock for UnreleasableLock {
        fn acquire(&self, key: &str) -> Result<LockToken> {
            Ok(LockToken {
                key: key.to_string(),
                holder: "test".to_string(),
            })
        }
        fn release(&self, _token: &LockToken) -> Result<()> {
            Err(SyncError::Persistence("release rpc failed".into()))
        }
    }

    #[test]
    fn failed_write_still_releases_the_lock() {
        let store = Arc::new(RejectingWrites(InMemoryDataStore::new()));
        let lock = Arc::new(PollingLock::new(
            store.clone(),
            Duration::from_secs(30),
            Backoff::default(),
        ));
        let state = SharedState::new(store.clone(), lock, 64);

        let err = state
            .update_merged("pages", &json!([1]), false, true, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::Persistence(_)));
        assert!(store.get("pages_lock").expect("lock record").is_none());
    }

    #[test]
    fn failed_release_after_write_reports_success() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let state = SharedState::new(store, Arc::new(UnreleasableLock), 64);

        let merged = state
            .update_merged("pages", &json!([1]), false, true, None)
            .expect("write landed");
        assert_eq!(merged, json!([1]));
        assert_eq!(state.get("pages").expect("get"), Some(json!([1])));
    }

    #[test]
    fn long_names_are_hashed_consistently() {
        let (state, store) = shared();
        let name = format!("feed/{}", "g".repeat(80));
        state.set(&name, &json!([1]), None).expect("set");
        assert_eq!(state.get(&name).expect("get"), Some(json!([1])));
        assert!(store.get(&name).expect("raw get").is_none());
        assert!(state.delete(&name).expect("delete"));
    }
}
