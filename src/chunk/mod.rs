//! Chunk records, payload encoding and chunk persistence.

pub mod memory;
pub mod models;
pub mod payload;
pub mod postgres;
pub mod sqlite;
pub mod store;

pub use memory::InMemoryChunkStore;
pub use models::{Chunk, ChunkId, ChunkStatus};
pub use payload::{decode_items, encode_items, ChunkItems, PAYLOAD_FORMAT, PAYLOAD_VERSION};
#[cfg(feature = "postgres")]
pub use postgres::PostgresChunkStore;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteChunkStore;
pub use store::ChunkStore;
