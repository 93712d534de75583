//! Named data persistence contracts.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

use super::models::NamedRecord;

/// Interval between attempts in the default blocking advisory lock.
const ADVISORY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Persistence for named records. Expired records behave as absent.
pub trait DataStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<NamedRecord>>;

    /// Overwrites `name`. `ttl = None` keeps the record until deleted.
    fn set(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<()>;

    fn delete(&self, name: &str) -> Result<bool>;

    /// Writes `name` only if it is absent or expired. Returns whether it wrote.
    fn insert_if_absent(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<bool>;

    /// Deletes `name` only if its stored value equals `expected`.
    fn compare_and_delete(&self, name: &str, expected: &Value) -> Result<bool>;

    /// Removes records that expired at or before `now`. Returns how many went.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// A store-native, TTL-bounded named mutex.
pub trait AdvisoryLockBackend: Send + Sync {
    /// Takes `key` for `holder` if it is free, expired, or already held by `holder`.
    fn try_advisory_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    fn advisory_unlock(&self, key: &str, holder: &str) -> Result<bool>;

    /// Blocks up to `wait` for the lock.
    fn advisory_lock(&self, key: &str, holder: &str, ttl: Duration, wait: Duration) -> Result<bool> {
        let started = Instant::now();
        loop {
            if self.try_advisory_lock(key, holder, ttl)? {
                return Ok(true);
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(false);
            }
            std::thread::sleep(ADVISORY_POLL_INTERVAL.min(wait - elapsed));
        }
    }
}
