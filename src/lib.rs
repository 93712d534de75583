//! Chunked batch synchronization.
//!
//! A host splits a large dataset into bounded chunks, each run as its own
//! queue action. This crate persists the chunks, drives their lifecycle from
//! queue callbacks, and signals the end of a run ("group") exactly once even
//! when many workers finish chunks concurrently. Shared run-scoped state is
//! updated through a keyed lock with merge-on-write semantics.
//!
//! ```
//! use std::sync::Arc;
//!
//! use chunk_sync::{
//!     ChunkItems, ChunkedSync, EventBus, InMemoryChunkStore, InMemoryJobQueue,
//!     LifecycleController, Result, ScheduleOptions, SyncConfig,
//! };
//!
//! struct Feed;
//!
//! impl ChunkedSync for Feed {
//!     fn name(&self) -> &str {
//!         "feed"
//!     }
//!
//!     fn process(&self, items: ChunkItems<'_>) -> Result<()> {
//!         for item in items {
//!             let (_key, _value) = item?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let queue = Arc::new(InMemoryJobQueue::new());
//! let controller = LifecycleController::new(
//!     Arc::new(Feed),
//!     Arc::new(InMemoryChunkStore::new()),
//!     queue.clone(),
//!     Arc::new(EventBus::new()),
//!     SyncConfig::default(),
//! );
//! controller.chunker().schedule_items(
//!     "run-1",
//!     vec![("sku-1", serde_json::json!(1)), ("sku-2", serde_json::json!(2))],
//!     &ScheduleOptions::default(),
//! )?;
//! while queue
//!     .run_next(&controller, |action| controller.execute(action))?
//!     .is_some()
//! {}
//! assert!(controller.summary("run-1")?.done);
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod merge;
pub mod postgres;
pub mod queue;
pub mod sqlite;
pub mod sync;

pub use chunk::{
    decode_items, encode_items, Chunk, ChunkId, ChunkItems, ChunkStatus, ChunkStore,
    InMemoryChunkStore,
};
#[cfg(feature = "postgres")]
pub use chunk::PostgresChunkStore;
#[cfg(feature = "sqlite-persistence")]
pub use chunk::SqliteChunkStore;
pub use config::SyncConfig;
pub use data::{
    normalize_key, process_identity, AdvisoryLockBackend, DataStore, InMemoryDataStore,
    KeyedLock, LockGuard, NamedRecord, NativeAdvisoryLock, PollingLock, SharedState,
};
#[cfg(feature = "postgres")]
pub use data::PostgresDataStore;
#[cfg(feature = "sqlite-persistence")]
pub use data::SqliteDataStore;
pub use error::{Result, SyncError};
pub use events::{EventBus, LifecycleEvent, LifecycleEventKind};
pub use merge::{merge, merge_values};
#[cfg(feature = "postgres")]
pub use postgres::PostgresDatabase;
pub use queue::{ActionId, ActionRecord, ActionStatus, InMemoryJobQueue, JobQueue, QueueListener};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteDatabase;
pub use sync::{
    stable_sync_name, ChunkCounter, ChunkedSync, Chunker, CleanupSweeper, GroupSummary,
    LifecycleController, ScheduleOptions, SweepReport,
};
