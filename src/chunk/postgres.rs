//! Postgres-backed chunk store.

#![cfg(feature = "postgres")]

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};

use crate::clock::{self, dt_to_us, us_to_dt};
use crate::error::{Result, SyncError};
use crate::postgres::PostgresDatabase;
use crate::queue::ActionId;

use super::models::{Chunk, ChunkId, ChunkStatus};
use super::store::ChunkStore;

const CHUNK_COLUMNS: &str =
    "id, action_id, group_name, status, data, created_at_us, start_us, end_us";

#[derive(Clone)]
pub struct PostgresChunkStore {
    db: PostgresDatabase,
}

impl PostgresChunkStore {
    pub fn new(db: PostgresDatabase) -> Self {
        Self { db }
    }
}

fn map_row_to_chunk(row: &PgRow) -> Result<Chunk> {
    let status: String = row.get(3);
    let status = ChunkStatus::parse(&status)
        .ok_or_else(|| SyncError::Persistence(format!("unknown chunk status '{status}'")))?;
    Ok(Chunk {
        id: Some(row.get::<i64, _>(0)),
        action_id: row.get::<Option<i64>, _>(1),
        group: row.get(2),
        status,
        data: row.get(4),
        created_at: us_to_dt(row.get::<i64, _>(5)),
        start: row.get::<Option<i64>, _>(6).map(us_to_dt),
        end: row.get::<Option<i64>, _>(7).map(us_to_dt),
    })
}

fn status_names(statuses: &[ChunkStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn all_status_names() -> Vec<String> {
    status_names(&ChunkStatus::ALL)
}

impl ChunkStore for PostgresChunkStore {
    fn save(&self, chunk: &Chunk) -> Result<ChunkId> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        let chunk = chunk.clone();
        let advances_from = status_names(&ChunkStatus::predecessors(chunk.status));
        rt.block_on(async move {
            let Some(id) = chunk.id else {
                let sql = format!(
                    "INSERT INTO \"{}\".sync_chunks
                     (action_id, group_name, status, data, created_at_us, start_us, end_us)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     RETURNING id",
                    schema
                );
                let id: i64 = sqlx::query_scalar(&sql)
                    .bind(chunk.action_id)
                    .bind(&chunk.group)
                    .bind(chunk.status.as_str())
                    .bind(&chunk.data)
                    .bind(dt_to_us(chunk.created_at))
                    .bind(chunk.start.map(dt_to_us))
                    .bind(chunk.end.map(dt_to_us))
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| SyncError::persistence("insert chunk", e))?;
                return Ok(id);
            };

            let sql = format!(
                "INSERT INTO \"{}\".sync_chunks AS c
                 (id, action_id, group_name, status, data, created_at_us, start_us, end_us)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT(id) DO UPDATE SET
                   action_id = COALESCE(EXCLUDED.action_id, c.action_id),
                   group_name = EXCLUDED.group_name,
                   status = CASE WHEN c.status = ANY($9)
                                 THEN EXCLUDED.status ELSE c.status END,
                   data = EXCLUDED.data,
                   start_us = COALESCE(EXCLUDED.start_us, c.start_us),
                   end_us = COALESCE(EXCLUDED.end_us, c.end_us)",
                schema
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(chunk.action_id)
                .bind(&chunk.group)
                .bind(chunk.status.as_str())
                .bind(&chunk.data)
                .bind(dt_to_us(chunk.created_at))
                .bind(chunk.start.map(dt_to_us))
                .bind(chunk.end.map(dt_to_us))
                .bind(&advances_from)
                .execute(&pool)
                .await
                .map_err(|e| SyncError::persistence("upsert chunk", e))?;

            // Explicit ids bypass the BIGSERIAL sequence; keep it ahead of them.
            sqlx::query(
                "SELECT setval(s.seq, GREATEST($2, COALESCE(pg_sequence_last_value(s.seq), 0), 1))
                 FROM (SELECT pg_get_serial_sequence($1, 'id')::regclass AS seq) s",
            )
            .bind(format!("\"{}\".sync_chunks", schema))
            .bind(id)
            .execute(&pool)
            .await
            .map_err(|e| SyncError::persistence("advance chunk id sequence", e))?;
            Ok(id)
        })
    }

    fn get(&self, id: ChunkId) -> Result<Option<Chunk>> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        rt.block_on(async move {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM \"{}\".sync_chunks WHERE id = $1",
                schema
            );
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&pool)
                .await
                .map_err(|e| SyncError::persistence("get chunk", e))?;
            row.as_ref().map(map_row_to_chunk).transpose()
        })
    }

    fn find_by_action(&self, action_id: ActionId) -> Result<Option<Chunk>> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        rt.block_on(async move {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM \"{}\".sync_chunks
                 WHERE action_id = $1 ORDER BY id ASC LIMIT 1",
                schema
            );
            let row = sqlx::query(&sql)
                .bind(action_id)
                .fetch_optional(&pool)
                .await
                .map_err(|e| SyncError::persistence("find chunk by action", e))?;
            row.as_ref().map(map_row_to_chunk).transpose()
        })
    }

    fn list_by_group_and_status(
        &self,
        group: &str,
        statuses: &[ChunkStatus],
    ) -> Result<Vec<Chunk>> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        let group = group.to_string();
        let statuses = if statuses.is_empty() {
            all_status_names()
        } else {
            status_names(statuses)
        };
        rt.block_on(async move {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM \"{}\".sync_chunks
                 WHERE group_name = $1 AND status = ANY($2)
                 ORDER BY id ASC",
                schema
            );
            let rows = sqlx::query(&sql)
                .bind(&group)
                .bind(&statuses)
                .fetch_all(&pool)
                .await
                .map_err(|e| SyncError::persistence("list chunks", e))?;
            rows.iter().map(map_row_to_chunk).collect()
        })
    }

    fn count_by_group_and_status(&self, group: &str, statuses: &[ChunkStatus]) -> Result<usize> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        let group = group.to_string();
        let statuses = if statuses.is_empty() {
            all_status_names()
        } else {
            status_names(statuses)
        };
        rt.block_on(async move {
            let sql = format!(
                "SELECT COUNT(*) FROM \"{}\".sync_chunks
                 WHERE group_name = $1 AND status = ANY($2)",
                schema
            );
            let count: i64 = sqlx::query_scalar(&sql)
                .bind(&group)
                .bind(&statuses)
                .fetch_one(&pool)
                .await
                .map_err(|e| SyncError::persistence("count chunks", e))?;
            Ok(count as usize)
        })
    }

    fn transition(&self, id: ChunkId, to: ChunkStatus, at: DateTime<Utc>) -> Result<bool> {
        let predecessors = status_names(&ChunkStatus::predecessors(to));
        if predecessors.is_empty() {
            return Ok(false);
        }
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        let timestamps = match to {
            ChunkStatus::Started => "start_us = $3",
            ChunkStatus::Running => "start_us = COALESCE(start_us, $3)",
            _ => "start_us = COALESCE(start_us, $3), end_us = $3",
        };
        rt.block_on(async move {
            let sql = format!(
                "UPDATE \"{}\".sync_chunks SET status = $2, {timestamps}
                 WHERE id = $1 AND status = ANY($4)",
                schema
            );
            let updated = sqlx::query(&sql)
                .bind(id)
                .bind(to.as_str())
                .bind(dt_to_us(at))
                .bind(&predecessors)
                .execute(&pool)
                .await
                .map_err(|e| SyncError::persistence("transition chunk", e))?
                .rows_affected();
            Ok(updated > 0)
        })
    }

    fn cleanup(
        &self,
        older_than: Duration,
        status: Option<ChunkStatus>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.db.ensure_schema()?;

        let pool = self.db.pool()?.clone();
        let rt = self.db.runtime()?;
        let schema = self.db.schema().to_string();
        let cutoff = dt_to_us(clock::cutoff(now, older_than));
        let status = status.map(|s| s.as_str().to_string());
        rt.block_on(async move {
            let sql = format!(
                "DELETE FROM \"{}\".sync_chunks
                 WHERE COALESCE(start_us, created_at_us) < $1
                   AND ($2::TEXT IS NULL OR status = $2)",
                schema
            );
            let removed = sqlx::query(&sql)
                .bind(cutoff)
                .bind(status)
                .execute(&pool)
                .await
                .map_err(|e| SyncError::persistence("cleanup chunks", e))?
                .rows_affected();
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::chunk::memory::tests::assert_chunk_store_contract;
    use crate::chunk::{Chunk, ChunkStore};
    use crate::postgres::{test_db_url, test_schema, PostgresDatabase};

    #[test]
    fn postgres_store_honours_chunk_store_contract_when_env_is_set() {
        let Some(db_url) = test_db_url() else {
            return;
        };
        let db = PostgresDatabase::new(db_url).with_schema(test_schema());
        assert_chunk_store_contract(&db.chunk_store());
    }

    #[test]
    fn explicit_ids_do_not_collide_with_later_inserts_when_env_is_set() {
        let Some(db_url) = test_db_url() else {
            return;
        };
        let store = PostgresDatabase::new(db_url)
            .with_schema(test_schema())
            .chunk_store();
        let first = store.save(&Chunk::new("g", "a")).expect("insert");
        let mut explicit = Chunk::new("g", "b");
        explicit.id = Some(first + 1);
        assert_eq!(store.save(&explicit).expect("explicit insert"), first + 1);
        let next = store.save(&Chunk::new("g", "c")).expect("insert after explicit");
        assert!(next > first + 1);
        assert_eq!(store.count_by_group("g").expect("count"), 3);
    }
}
