//! SQLite connection shared by the chunk store and the named data store.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};

use crate::chunk::SqliteChunkStore;
use crate::clock;
use crate::data::SqliteDataStore;
use crate::error::{Result, SyncError};

pub(crate) const SQLITE_SCHEMA_VERSION: i64 = 2;

/// Handle to one SQLite database holding chunk-sync tables.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Opens (or creates) the database and applies pending migrations.
    /// `":memory:"` gives a private in-memory database.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| SyncError::persistence("open sqlite database", e))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| SyncError::persistence("set sqlite busy timeout", e))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn chunk_store(&self) -> SqliteChunkStore {
        SqliteChunkStore::new(self.clone())
    }

    pub fn data_store(&self) -> SqliteDataStore {
        SqliteDataStore::new(self.clone())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Persistence("sqlite connection lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        ensure_migration_table(&conn)?;
        let current = current_schema_version(&conn)?;
        if current > SQLITE_SCHEMA_VERSION {
            return Err(SyncError::Persistence(format!(
                "sqlite schema version {} is newer than supported {}",
                current, SQLITE_SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "chunks_and_named_data")?;
        }
        if current < 2 {
            apply_migration_v2(&conn)?;
            record_migration(&conn, 2, "named_locks")?;
        }
        Ok(())
    }
}

pub(crate) fn map_rusqlite_err(err: rusqlite::Error) -> SyncError {
    SyncError::persistence("sqlite", err)
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_sync_schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_us INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| SyncError::persistence("init sqlite migration table", e))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM chunk_sync_schema_migrations",
        [],
        |r| r.get(0),
    )
    .map_err(|e| SyncError::persistence("read sqlite schema version", e))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO chunk_sync_schema_migrations(version, name, applied_at_us)
         VALUES (?1, ?2, ?3)",
        params![version, name, clock::dt_to_us(clock::now())],
    )
    .map_err(|e| SyncError::persistence("record sqlite migration", e))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_chunks (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          action_id INTEGER NULL,
          group_name TEXT NOT NULL,
          status TEXT NOT NULL,
          data TEXT NOT NULL,
          created_at_us INTEGER NOT NULL,
          start_us INTEGER NULL,
          end_us INTEGER NULL
        );
        CREATE TABLE IF NOT EXISTS sync_named_data (
          name TEXT NOT NULL UNIQUE,
          value TEXT NOT NULL,
          expires_at_us INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_chunks_status ON sync_chunks(status);
        CREATE INDEX IF NOT EXISTS idx_sync_chunks_start ON sync_chunks(start_us);
        CREATE INDEX IF NOT EXISTS idx_sync_chunks_end ON sync_chunks(end_us);
        CREATE INDEX IF NOT EXISTS idx_sync_chunks_group ON sync_chunks(group_name, status);
        CREATE INDEX IF NOT EXISTS idx_sync_chunks_action ON sync_chunks(action_id);
        CREATE INDEX IF NOT EXISTS idx_sync_named_data_expires ON sync_named_data(expires_at_us);
        "#,
    )
    .map_err(|e| SyncError::persistence("apply sqlite migration v1", e))
}

fn apply_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_named_locks (
          name TEXT PRIMARY KEY,
          holder TEXT NOT NULL,
          expires_at_us INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| SyncError::persistence("apply sqlite migration v2", e))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn temp_sqlite_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chunk-sync-{}-{}.db", name, uuid::Uuid::new_v4()))
    }

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get::<_, i64>(0),
        )
        .map(|count| count > 0)
        .unwrap_or(false)
    }

    #[test]
    fn clean_init_reaches_latest_version_and_reopen_is_idempotent() {
        let path = temp_sqlite_path("schema");
        let path_str = path.to_string_lossy().to_string();
        SqliteDatabase::open(&path_str).expect("first open");
        SqliteDatabase::open(&path_str).expect("second open");

        let conn = Connection::open(&path).expect("open sqlite db");
        let version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM chunk_sync_schema_migrations",
                [],
                |r| r.get(0),
            )
            .expect("read version");
        assert_eq!(version, SQLITE_SCHEMA_VERSION);
        assert!(table_exists(&conn, "sync_chunks"));
        assert!(table_exists(&conn, "sync_named_data"));
        assert!(table_exists(&conn, "sync_named_locks"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn newer_schema_is_refused() {
        let path = temp_sqlite_path("schema-newer");
        let path_str = path.to_string_lossy().to_string();
        SqliteDatabase::open(&path_str).expect("open");
        {
            let conn = Connection::open(&path).expect("open raw");
            record_migration(&conn, SQLITE_SCHEMA_VERSION + 1, "future").expect("record");
        }
        let err = SqliteDatabase::open(&path_str).err().expect("refused");
        assert!(err.to_string().contains("newer than supported"));
        let _ = std::fs::remove_file(path);
    }
}
