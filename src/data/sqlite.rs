//! SQLite-backed named data store and advisory lock.

#![cfg(feature = "sqlite-persistence")]

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::clock::{self, dt_to_us, us_to_dt};
use crate::error::{Result, SyncError};
use crate::sqlite::{map_rusqlite_err, SqliteDatabase};

use super::models::NamedRecord;
use super::store::{AdvisoryLockBackend, DataStore};

#[derive(Clone)]
pub struct SqliteDataStore {
    db: SqliteDatabase,
}

impl SqliteDataStore {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(SqliteDatabase::open(db_path)?))
    }

    /// Current holder of an advisory lock, if any.
    pub fn lock_holder(&self, key: &str) -> Result<Option<String>> {
        let conn = self.db.conn()?;
        conn.query_row(
            "SELECT holder FROM sync_named_locks WHERE name = ?1 AND expires_at_us > ?2",
            params![key, dt_to_us(clock::now())],
            |r| r.get(0),
        )
        .optional()
        .map_err(map_rusqlite_err)
    }
}

fn expiry_us(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| dt_to_us(clock::expires_at(now, ttl)))
}

impl DataStore for SqliteDataStore {
    fn get(&self, name: &str) -> Result<Option<NamedRecord>> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                "SELECT value, expires_at_us FROM sync_named_data
                 WHERE name = ?1 AND (expires_at_us IS NULL OR expires_at_us > ?2)",
                params![name, dt_to_us(clock::now())],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<i64>>(1)?)),
            )
            .optional()
            .map_err(map_rusqlite_err)?;
        let Some((value, expires_at_us)) = row else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&value)
            .map_err(|e| SyncError::persistence("decode named data", e))?;
        Ok(Some(NamedRecord::new(
            name,
            value,
            expires_at_us.map(us_to_dt),
        )))
    }

    fn set(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO sync_named_data(name, value, expires_at_us) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
               value = excluded.value,
               expires_at_us = excluded.expires_at_us",
            params![name, encoded, expiry_us(clock::now(), ttl)],
        )
        .map_err(map_rusqlite_err)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let removed = conn
            .execute("DELETE FROM sync_named_data WHERE name = ?1", params![name])
            .map_err(map_rusqlite_err)?;
        Ok(removed > 0)
    }

    fn insert_if_absent(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
        let encoded = serde_json::to_string(value)?;
        let now = clock::now();
        let conn = self.db.conn()?;
        let written = conn
            .execute(
                "INSERT INTO sync_named_data(name, value, expires_at_us) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                   value = excluded.value,
                   expires_at_us = excluded.expires_at_us
                 WHERE sync_named_data.expires_at_us IS NOT NULL
                   AND sync_named_data.expires_at_us <= ?4",
                params![name, encoded, expiry_us(now, ttl), dt_to_us(now)],
            )
            .map_err(map_rusqlite_err)?;
        Ok(written > 0)
    }

    fn compare_and_delete(&self, name: &str, expected: &Value) -> Result<bool> {
        let encoded = serde_json::to_string(expected)?;
        let conn = self.db.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM sync_named_data WHERE name = ?1 AND value = ?2",
                params![name, encoded],
            )
            .map_err(map_rusqlite_err)?;
        Ok(removed > 0)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_us = dt_to_us(now);
        let conn = self.db.conn()?;
        let data = conn
            .execute(
                "DELETE FROM sync_named_data
                 WHERE expires_at_us IS NOT NULL AND expires_at_us <= ?1",
                params![now_us],
            )
            .map_err(map_rusqlite_err)?;
        let locks = conn
            .execute(
                "DELETE FROM sync_named_locks WHERE expires_at_us <= ?1",
                params![now_us],
            )
            .map_err(map_rusqlite_err)?;
        Ok((data + locks) as u64)
    }
}

impl AdvisoryLockBackend for SqliteDataStore {
    fn try_advisory_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = clock::now();
        let conn = self.db.conn()?;
        let taken = conn
            .execute(
                "INSERT INTO sync_named_locks(name, holder, expires_at_us) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                   holder = excluded.holder,
                   expires_at_us = excluded.expires_at_us
                 WHERE sync_named_locks.holder = excluded.holder
                    OR sync_named_locks.expires_at_us <= ?4",
                params![key, holder, dt_to_us(clock::expires_at(now, ttl)), dt_to_us(now)],
            )
            .map_err(map_rusqlite_err)?;
        Ok(taken > 0)
    }

    fn advisory_unlock(&self, key: &str, holder: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM sync_named_locks WHERE name = ?1 AND holder = ?2",
                params![key, holder],
            )
            .map_err(map_rusqlite_err)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::config::SyncConfig;
    use crate::data::lock::NativeAdvisoryLock;
    use crate::data::memory::tests::{assert_advisory_lock_contract, assert_data_store_contract};
    use crate::data::shared::SharedState;

    use super::*;

    fn store() -> SqliteDataStore {
        SqliteDataStore::open(":memory:").expect("open sqlite store")
    }

    #[test]
    fn sqlite_store_honours_data_store_contract() {
        assert_data_store_contract(&store());
    }

    #[test]
    fn sqlite_store_honours_advisory_lock_contract() {
        assert_advisory_lock_contract(&store());
    }

    #[test]
    fn shared_state_over_native_lock_releases_the_lock_row() {
        let store = store();
        let backend = Arc::new(store.clone());
        let lock = Arc::new(NativeAdvisoryLock::from_config(
            backend,
            &SyncConfig::default(),
        ));
        let state = SharedState::new(Arc::new(store.clone()), lock, 64);

        let merged = state
            .update_merged("feed/run-1/pages", &json!([1, 2]), false, true, None)
            .expect("update");
        assert_eq!(merged, json!([1, 2]));
        let merged = state
            .update_merged("feed/run-1/pages", &json!([3]), false, true, None)
            .expect("update again");
        assert_eq!(merged, json!([1, 2, 3]));
        assert_eq!(
            store.lock_holder("feed/run-1/pages_lock").expect("holder"),
            None
        );
    }
}
