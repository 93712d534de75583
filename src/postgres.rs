//! Postgres connection shared by the chunk store and the named data store.
//!
//! This module is feature-gated behind `postgres`. Stores expose a blocking
//! API; queries run on a private single-worker tokio runtime.

#![cfg(feature = "postgres")]

use std::sync::{Arc, OnceLock};

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::chunk::PostgresChunkStore;
use crate::data::PostgresDataStore;
use crate::error::{Result, SyncError};

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn new_db_runtime() -> std::result::Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<std::result::Result<Arc<tokio::runtime::Runtime>, String>> =
        OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("chunk-sync-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[derive(Clone)]
pub struct PostgresDatabase {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    schema_ready: Arc<OnceLock<std::result::Result<(), String>>>,
}

impl PostgresDatabase {
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&database_url)
            .ok();
        let init_error = if pool.is_some() {
            None
        } else {
            Some("failed to initialize lazy postgres pool".to_string())
        };

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime: new_db_runtime().ok(),
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: new_db_runtime().ok(),
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self.schema_ready = Arc::new(OnceLock::new());
        self
    }

    pub fn chunk_store(&self) -> PostgresChunkStore {
        PostgresChunkStore::new(self.clone())
    }

    pub fn data_store(&self) -> PostgresDataStore {
        PostgresDataStore::new(self.clone())
    }

    pub(crate) fn schema(&self) -> &str {
        &self.schema
    }

    pub(crate) fn runtime(&self) -> Result<&tokio::runtime::Runtime> {
        if let Some(err) = &self.init_error {
            return Err(SyncError::persistence("postgres init error", err));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| SyncError::persistence("runtime not available", "no db runtime"))
    }

    pub(crate) fn pool(&self) -> Result<&PgPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| SyncError::persistence("pool not available", "no postgres pool"))
    }

    pub(crate) fn ensure_schema(&self) -> Result<()> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(SyncError::persistence("invalid schema", &self.schema));
        }

        let result = self.schema_ready.get_or_init(|| {
            let schema = self.schema.clone();
            let statements = vec![
                format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema),
                format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\".sync_chunks (
                        id BIGSERIAL PRIMARY KEY,
                        action_id BIGINT NULL,
                        group_name TEXT NOT NULL,
                        status TEXT NOT NULL,
                        data TEXT NOT NULL,
                        created_at_us BIGINT NOT NULL,
                        start_us BIGINT NULL,
                        end_us BIGINT NULL
                    )",
                    schema
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\".sync_named_data (
                        name TEXT PRIMARY KEY,
                        value TEXT NOT NULL,
                        expires_at_us BIGINT NULL
                    )",
                    schema
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\".sync_named_locks (
                        name TEXT PRIMARY KEY,
                        holder TEXT NOT NULL,
                        expires_at_us BIGINT NOT NULL
                    )",
                    schema
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_sync_chunks_group
                     ON \"{}\".sync_chunks(group_name, status)",
                    schema
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_sync_chunks_action
                     ON \"{}\".sync_chunks(action_id)",
                    schema
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_sync_chunks_start
                     ON \"{}\".sync_chunks(start_us)",
                    schema
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_sync_chunks_end
                     ON \"{}\".sync_chunks(end_us)",
                    schema
                ),
            ];

            let pool = match self.pool() {
                Ok(p) => p.clone(),
                Err(e) => return Err(e.to_string()),
            };
            let rt = match self.runtime() {
                Ok(r) => r,
                Err(e) => return Err(e.to_string()),
            };

            rt.block_on(async {
                for sql in &statements {
                    sqlx::query(sql).execute(&pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| e.to_string())
        });

        result
            .clone()
            .map_err(|e| SyncError::persistence("schema bootstrap", e))
    }
}

#[cfg(test)]
pub(crate) fn test_db_url() -> Option<String> {
    std::env::var("CHUNK_SYNC_TEST_POSTGRES_URL").ok()
}

#[cfg(test)]
pub(crate) fn test_schema() -> String {
    format!("chunk_sync_test_{}", uuid::Uuid::new_v4().simple())
}
