//! Runtime configuration.
//!
//! ```
//! use chunk_sync::SyncConfig;
//!
//! let config = SyncConfig {
//!     chunk_size: 100,
//!     chunk_limit: Some(20),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.lock_wait_ms, 5_000);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::chunk::ChunkStatus;
use crate::data::HASHED_KEY_LEN;
use crate::error::{Result, SyncError};

const ENV_PREFIX: &str = "CHUNK_SYNC_";

/// Tuning knobs for chunking, locking and retention.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Maximum number of items per chunk when splitting an item stream.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum number of chunks scheduled per group; later chunks are dropped.
    #[serde(default)]
    pub chunk_limit: Option<usize>,
    /// Total time budget for acquiring a keyed lock.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_lock_initial_backoff_ms")]
    pub lock_initial_backoff_ms: u64,
    /// Relative jitter applied to each backoff delay (0.08 = ±8%).
    #[serde(default = "default_lock_jitter")]
    pub lock_jitter: f64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Keys longer than this are hashed before they reach storage.
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Only sweep chunks in this status when set.
    #[serde(default)]
    pub cleanup_status: Option<ChunkStatus>,
    #[serde(default = "default_finish_query_limit")]
    pub finish_query_limit: usize,
}

fn default_chunk_size() -> usize {
    500
}
fn default_lock_wait_ms() -> u64 {
    5_000
}
fn default_lock_initial_backoff_ms() -> u64 {
    100
}
fn default_lock_jitter() -> f64 {
    0.08
}
fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_max_key_len() -> usize {
    64
}
fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}
fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}
fn default_finish_query_limit() -> usize {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_limit: None,
            lock_wait_ms: default_lock_wait_ms(),
            lock_initial_backoff_ms: default_lock_initial_backoff_ms(),
            lock_jitter: default_lock_jitter(),
            lock_ttl_secs: default_lock_ttl_secs(),
            max_key_len: default_max_key_len(),
            retention_secs: default_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            cleanup_status: None,
            finish_query_limit: default_finish_query_limit(),
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `CHUNK_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("CHUNK_SIZE") {
            config.chunk_size = parse_env("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("CHUNK_LIMIT") {
            config.chunk_limit = Some(parse_env("CHUNK_LIMIT", &v)?);
        }
        if let Some(v) = get("LOCK_WAIT_MS") {
            config.lock_wait_ms = parse_env("LOCK_WAIT_MS", &v)?;
        }
        if let Some(v) = get("LOCK_INITIAL_BACKOFF_MS") {
            config.lock_initial_backoff_ms = parse_env("LOCK_INITIAL_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("LOCK_JITTER") {
            config.lock_jitter = parse_env("LOCK_JITTER", &v)?;
        }
        if let Some(v) = get("LOCK_TTL_SECS") {
            config.lock_ttl_secs = parse_env("LOCK_TTL_SECS", &v)?;
        }
        if let Some(v) = get("MAX_KEY_LEN") {
            config.max_key_len = parse_env("MAX_KEY_LEN", &v)?;
        }
        if let Some(v) = get("RETENTION_SECS") {
            config.retention_secs = parse_env("RETENTION_SECS", &v)?;
        }
        if let Some(v) = get("CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval_secs = parse_env("CLEANUP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("CLEANUP_STATUS") {
            let status = ChunkStatus::parse(&v).ok_or_else(|| {
                SyncError::Config(format!("{ENV_PREFIX}CLEANUP_STATUS: unknown status '{v}'"))
            })?;
            config.cleanup_status = Some(status);
        }
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| SyncError::Config(format!("parse toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be > 0".to_string()));
        }
        if self.lock_wait_ms == 0 {
            return Err(SyncError::Config("lock_wait_ms must be > 0".to_string()));
        }
        if self.lock_initial_backoff_ms == 0 {
            return Err(SyncError::Config(
                "lock_initial_backoff_ms must be > 0".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(SyncError::Config(
                "cleanup_interval_secs must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.lock_jitter) {
            return Err(SyncError::Config(
                "lock_jitter must be within [0, 1)".to_string(),
            ));
        }
        if self.max_key_len < HASHED_KEY_LEN {
            return Err(SyncError::Config(format!(
                "max_key_len must be >= {HASHED_KEY_LEN}"
            )));
        }
        if self.finish_query_limit == 0 {
            return Err(SyncError::Config(
                "finish_query_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SyncError::Config(format!("{ENV_PREFIX}{name}: {e}")))
}
