//! Postgres-backed named data store and advisory lock.

#![cfg(feature = "postgres")]

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use crate::clock::{self, dt_to_us, us_to_dt};
use crate::error::{Result, SyncError};
use crate::postgres::PostgresDatabase;

use super::models::NamedRecord;
use super::store::{AdvisoryLockBackend, DataStore};

#[derive(Clone)]
pub struct PostgresDataStore {
    db: PostgresDatabase,
}

impl PostgresDataStore {
    pub fn new(db: PostgresDatabase) -> Self {
        Self { db }
    }

    /// Runs one statement and returns the affected row count.
    fn execute(&self, context: &'static str, sql: String, binds: Binds) -> Result<u64> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        rt.block_on(async move {
            let mut query = sqlx::query(&sql);
            for bind in binds {
                query = match bind {
                    Bind::Text(v) => query.bind(v),
                    Bind::Int(v) => query.bind(v),
                };
            }
            Ok(query
                .execute(&pool)
                .await
                .map_err(|e| SyncError::persistence(context, e))?
                .rows_affected())
        })
    }
}

enum Bind {
    Text(Option<String>),
    Int(Option<i64>),
}

type Binds = Vec<Bind>;

fn text(value: impl Into<String>) -> Bind {
    Bind::Text(Some(value.into()))
}

fn int(value: Option<i64>) -> Bind {
    Bind::Int(value)
}

fn expiry_us(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| dt_to_us(clock::expires_at(now, ttl)))
}

impl DataStore for PostgresDataStore {
    fn get(&self, name: &str) -> Result<Option<NamedRecord>> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        let owned_name = name.to_string();
        let row = rt.block_on(async move {
            let sql = format!(
                "SELECT value, expires_at_us FROM \"{}\".sync_named_data
                 WHERE name = $1 AND (expires_at_us IS NULL OR expires_at_us > $2)",
                schema
            );
            sqlx::query(&sql)
                .bind(&owned_name)
                .bind(dt_to_us(clock::now()))
                .fetch_optional(&pool)
                .await
                .map_err(|e| SyncError::persistence("get named data", e))
        })?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.get(0);
        let expires_at_us: Option<i64> = row.get(1);
        let value: Value = serde_json::from_str(&value)
            .map_err(|e| SyncError::persistence("decode named data", e))?;
        Ok(Some(NamedRecord::new(
            name,
            value,
            expires_at_us.map(us_to_dt),
        )))
    }

    fn set(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let sql = format!(
            "INSERT INTO \"{}\".sync_named_data(name, value, expires_at_us) VALUES ($1, $2, $3)
             ON CONFLICT(name) DO UPDATE SET
               value = EXCLUDED.value,
               expires_at_us = EXCLUDED.expires_at_us",
            self.db.schema()
        );
        let binds = vec![
            text(name),
            text(serde_json::to_string(value)?),
            int(expiry_us(clock::now(), ttl)),
        ];
        self.execute("set named data", sql, binds)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM \"{}\".sync_named_data WHERE name = $1",
            self.db.schema()
        );
        Ok(self.execute("delete named data", sql, vec![text(name)])? > 0)
    }

    fn insert_if_absent(&self, name: &str, value: &Value, ttl: Option<Duration>) -> Result<bool> {
        let now = clock::now();
        let sql = format!(
            "INSERT INTO \"{0}\".sync_named_data AS d (name, value, expires_at_us)
             VALUES ($1, $2, $3)
             ON CONFLICT(name) DO UPDATE SET
               value = EXCLUDED.value,
               expires_at_us = EXCLUDED.expires_at_us
             WHERE d.expires_at_us IS NOT NULL AND d.expires_at_us <= $4",
            self.db.schema()
        );
        let binds = vec![
            text(name),
            text(serde_json::to_string(value)?),
            int(expiry_us(now, ttl)),
            int(Some(dt_to_us(now))),
        ];
        Ok(self.execute("insert named data", sql, binds)? > 0)
    }

    fn compare_and_delete(&self, name: &str, expected: &Value) -> Result<bool> {
        let sql = format!(
            "DELETE FROM \"{}\".sync_named_data WHERE name = $1 AND value = $2",
            self.db.schema()
        );
        let binds = vec![text(name), text(serde_json::to_string(expected)?)];
        Ok(self.execute("compare and delete named data", sql, binds)? > 0)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_us = dt_to_us(now);
        let data = self.execute(
            "purge named data",
            format!(
                "DELETE FROM \"{}\".sync_named_data
                 WHERE expires_at_us IS NOT NULL AND expires_at_us <= $1",
                self.db.schema()
            ),
            vec![int(Some(now_us))],
        )?;
        let locks = self.execute(
            "purge named locks",
            format!(
                "DELETE FROM \"{}\".sync_named_locks WHERE expires_at_us <= $1",
                self.db.schema()
            ),
            vec![int(Some(now_us))],
        )?;
        Ok(data + locks)
    }
}

impl AdvisoryLockBackend for PostgresDataStore {
    fn try_advisory_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = clock::now();
        let sql = format!(
            "INSERT INTO \"{}\".sync_named_locks AS l (name, holder, expires_at_us)
             VALUES ($1, $2, $3)
             ON CONFLICT(name) DO UPDATE SET
               holder = EXCLUDED.holder,
               expires_at_us = EXCLUDED.expires_at_us
             WHERE l.holder = EXCLUDED.holder OR l.expires_at_us <= $4",
            self.db.schema()
        );
        let binds = vec![
            text(key),
            text(holder),
            int(Some(dt_to_us(clock::expires_at(now, ttl)))),
            int(Some(dt_to_us(now))),
        ];
        Ok(self.execute("take advisory lock", sql, binds)? > 0)
    }

    fn advisory_unlock(&self, key: &str, holder: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM \"{}\".sync_named_locks WHERE name = $1 AND holder = $2",
            self.db.schema()
        );
        Ok(self.execute("release advisory lock", sql, vec![text(key), text(holder)])? > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::data::memory::tests::{assert_advisory_lock_contract, assert_data_store_contract};
    use crate::postgres::{test_db_url, test_schema, PostgresDatabase};

    #[test]
    fn postgres_store_honours_contracts_when_env_is_set() {
        let Some(db_url) = test_db_url() else {
            return;
        };
        let db = PostgresDatabase::new(db_url).with_schema(test_schema());
        let store = db.data_store();
        assert_data_store_contract(&store);
        assert_advisory_lock_contract(&store);
    }
}
