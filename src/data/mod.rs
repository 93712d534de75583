//! Named data records, keyed locks and merge-on-write shared state.

pub mod key;
pub mod lock;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod shared;
pub mod sqlite;
pub mod store;

pub use key::{lock_key, normalize_key, HASHED_KEY_LEN};
pub use lock::{
    process_identity, Backoff, KeyedLock, LockGuard, LockToken, NativeAdvisoryLock, PollingLock,
};
pub use memory::InMemoryDataStore;
pub use models::NamedRecord;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDataStore;
pub use shared::SharedState;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteDataStore;
pub use store::{AdvisoryLockBackend, DataStore};
