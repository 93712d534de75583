//! SQLite-backed chunk store.

#![cfg(feature = "sqlite-persistence")]

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::clock::{self, dt_to_us, us_to_dt};
use crate::error::{Result, SyncError};
use crate::queue::ActionId;
use crate::sqlite::{map_rusqlite_err, SqliteDatabase};

use super::models::{Chunk, ChunkId, ChunkStatus};
use super::store::ChunkStore;

const CHUNK_COLUMNS: &str =
    "id, action_id, group_name, status, data, created_at_us, start_us, end_us";

#[derive(Clone)]
pub struct SqliteChunkStore {
    db: SqliteDatabase,
}

impl SqliteChunkStore {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    /// Opens a database and returns a chunk store over it.
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(SqliteDatabase::open(db_path)?))
    }
}

fn map_row_to_chunk(row: &Row) -> rusqlite::Result<Chunk> {
    let status: String = row.get(3)?;
    let status = ChunkStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            Box::new(SyncError::Persistence(format!(
                "unknown chunk status '{status}'"
            ))),
        )
    })?;
    Ok(Chunk {
        id: Some(row.get(0)?),
        action_id: row.get(1)?,
        group: row.get(2)?,
        status,
        data: row.get(4)?,
        created_at: us_to_dt(row.get(5)?),
        start: row.get::<_, Option<i64>>(6)?.map(us_to_dt),
        end: row.get::<_, Option<i64>>(7)?.map(us_to_dt),
    })
}

/// `status IN (...)` clause over static status names, or `1 = 1` when empty.
fn status_clause(statuses: &[ChunkStatus]) -> String {
    if statuses.is_empty() {
        return "1 = 1".to_string();
    }
    let names: Vec<String> = statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("status IN ({})", names.join(", "))
}

/// Condition under which a stored status may be replaced by `incoming`.
fn advances_to(incoming: ChunkStatus) -> String {
    let predecessors = ChunkStatus::predecessors(incoming);
    if predecessors.is_empty() {
        return "1 = 0".to_string();
    }
    let names: Vec<String> = predecessors
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("sync_chunks.status IN ({})", names.join(", "))
}

impl ChunkStore for SqliteChunkStore {
    fn save(&self, chunk: &Chunk) -> Result<ChunkId> {
        let conn = self.db.conn()?;
        match chunk.id {
            None => {
                conn.execute(
                    "INSERT INTO sync_chunks
                     (action_id, group_name, status, data, created_at_us, start_us, end_us)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        chunk.action_id,
                        chunk.group,
                        chunk.status.as_str(),
                        chunk.data,
                        dt_to_us(chunk.created_at),
                        chunk.start.map(dt_to_us),
                        chunk.end.map(dt_to_us),
                    ],
                )
                .map_err(|e| SyncError::persistence("insert chunk", e))?;
                Ok(conn.last_insert_rowid())
            }
            Some(id) => {
                let sql = format!(
                    "INSERT INTO sync_chunks
                     (id, action_id, group_name, status, data, created_at_us, start_us, end_us)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                       action_id = COALESCE(excluded.action_id, sync_chunks.action_id),
                       group_name = excluded.group_name,
                       status = CASE WHEN {advances}
                                     THEN excluded.status ELSE sync_chunks.status END,
                       data = excluded.data,
                       start_us = COALESCE(excluded.start_us, sync_chunks.start_us),
                       end_us = COALESCE(excluded.end_us, sync_chunks.end_us)",
                    advances = advances_to(chunk.status)
                );
                conn.execute(
                    &sql,
                    params![
                        id,
                        chunk.action_id,
                        chunk.group,
                        chunk.status.as_str(),
                        chunk.data,
                        dt_to_us(chunk.created_at),
                        chunk.start.map(dt_to_us),
                        chunk.end.map(dt_to_us),
                    ],
                )
                .map_err(|e| SyncError::persistence("upsert chunk", e))?;
                Ok(id)
            }
        }
    }

    fn get(&self, id: ChunkId) -> Result<Option<Chunk>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {CHUNK_COLUMNS} FROM sync_chunks WHERE id = ?1"),
            params![id],
            map_row_to_chunk,
        )
        .optional()
        .map_err(|e| SyncError::persistence("get chunk", e))
    }

    fn find_by_action(&self, action_id: ActionId) -> Result<Option<Chunk>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "SELECT {CHUNK_COLUMNS} FROM sync_chunks
                 WHERE action_id = ?1 ORDER BY id ASC LIMIT 1"
            ),
            params![action_id],
            map_row_to_chunk,
        )
        .optional()
        .map_err(|e| SyncError::persistence("find chunk by action", e))
    }

    fn list_by_group_and_status(
        &self,
        group: &str,
        statuses: &[ChunkStatus],
    ) -> Result<Vec<Chunk>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM sync_chunks
             WHERE group_name = ?1 AND {}
             ORDER BY id ASC",
            status_clause(statuses)
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SyncError::persistence("prepare list chunks", e))?;
        let rows = stmt
            .query_map(params![group], map_row_to_chunk)
            .map_err(|e| SyncError::persistence("query chunks", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(map_rusqlite_err)?);
        }
        Ok(out)
    }

    fn count_by_group_and_status(&self, group: &str, statuses: &[ChunkStatus]) -> Result<usize> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT COUNT(*) FROM sync_chunks WHERE group_name = ?1 AND {}",
            status_clause(statuses)
        );
        let count: i64 = conn
            .query_row(&sql, params![group], |r| r.get(0))
            .map_err(|e| SyncError::persistence("count chunks", e))?;
        Ok(count as usize)
    }

    fn transition(&self, id: ChunkId, to: ChunkStatus, at: DateTime<Utc>) -> Result<bool> {
        let predecessors = ChunkStatus::predecessors(to);
        if predecessors.is_empty() {
            return Ok(false);
        }
        let timestamps = match to {
            ChunkStatus::Started => "start_us = ?3",
            ChunkStatus::Running => "start_us = COALESCE(start_us, ?3)",
            _ => "start_us = COALESCE(start_us, ?3), end_us = ?3",
        };
        let sql = format!(
            "UPDATE sync_chunks SET status = ?2, {timestamps}
             WHERE id = ?1 AND {}",
            status_clause(&predecessors)
        );
        let conn = self.db.conn()?;
        let updated = conn
            .execute(&sql, params![id, to.as_str(), dt_to_us(at)])
            .map_err(|e| SyncError::persistence("transition chunk", e))?;
        Ok(updated > 0)
    }

    fn cleanup(
        &self,
        older_than: Duration,
        status: Option<ChunkStatus>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cutoff = dt_to_us(clock::cutoff(now, older_than));
        let conn = self.db.conn()?;
        let mut bind: Vec<rusqlite::types::Value> = vec![cutoff.into()];
        let mut sql =
            "DELETE FROM sync_chunks WHERE COALESCE(start_us, created_at_us) < ?1".to_string();
        if let Some(status) = status {
            sql.push_str(" AND status = ?2");
            bind.push(status.as_str().to_string().into());
        }
        let removed = conn
            .execute(&sql, params_from_iter(bind))
            .map_err(|e| SyncError::persistence("cleanup chunks", e))?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::memory::tests::assert_chunk_store_contract;

    #[test]
    fn sqlite_store_honours_chunk_store_contract() {
        let store = SqliteChunkStore::open(":memory:").expect("sqlite chunk store");
        assert_chunk_store_contract(&store);
    }

    #[test]
    fn explicit_id_upsert_inserts_missing_rows() {
        let store = SqliteChunkStore::open(":memory:").expect("sqlite chunk store");
        let mut chunk = Chunk::new("g", "payload");
        chunk.id = Some(77);
        assert_eq!(store.save(&chunk).expect("upsert"), 77);
        let loaded = store.get(77).expect("get").expect("exists");
        assert_eq!(loaded.group, "g");
        assert_eq!(loaded.status, ChunkStatus::Scheduled);
        assert!(loaded.start.is_none());
    }

    #[test]
    fn unknown_stored_status_is_an_error() {
        let db = SqliteDatabase::open(":memory:").expect("sqlite");
        let store = db.chunk_store();
        let id = store.save(&Chunk::new("g", "x")).expect("save");
        db.conn()
            .expect("conn")
            .execute(
                "UPDATE sync_chunks SET status = 'paused' WHERE id = ?1",
                params![id],
            )
            .expect("corrupt status");
        assert!(matches!(store.get(id), Err(SyncError::Persistence(_))));
    }
}
