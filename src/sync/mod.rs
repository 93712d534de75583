//! Host-defined syncs and the machinery that drives them: chunk scheduling,
//! lifecycle callbacks, group completion and retention.

pub mod chunker;
pub mod cleanup;
pub mod controller;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::chunk::ChunkItems;
use crate::error::Result;
use crate::events::LifecycleEvent;

pub use chunker::{ChunkCounter, Chunker, ScheduleOptions};
pub use cleanup::{CleanupSweeper, SweepReport};
pub use controller::{GroupSummary, LifecycleController};

/// A unit of host work, such as "import product feed", processed in chunks.
///
/// Only [`ChunkedSync::name`] and [`ChunkedSync::process`] are required; the
/// lifecycle hooks default to no-ops.
pub trait ChunkedSync: Send + Sync {
    /// Stable name used as the hook and event prefix.
    fn name(&self) -> &str;

    /// Processes one chunk. Errors are returned to the queue, which reports
    /// them back as a failed execution.
    fn process(&self, items: ChunkItems<'_>) -> Result<()>;

    fn on_start(&self, _event: &LifecycleEvent) {}

    /// Called once per group, after every chunk reached a terminal status.
    fn on_finish(&self, _group: &str) {}

    fn on_fail(&self, _event: &LifecycleEvent) {}
}

pub fn run_chunk_hook(sync_name: &str) -> String {
    format!("{sync_name}/run_chunk")
}

pub fn finish_hook(sync_name: &str) -> String {
    format!("{sync_name}/finish")
}

/// Dedup key of the finish action for `group`.
pub fn finish_unique_key(sync_name: &str, group: &str) -> String {
    format!("{sync_name}/finish:{group}")
}

/// Hooks for group-level actions, which never carry a chunk.
pub(crate) fn is_lifecycle_hook(hook: &str) -> bool {
    hook.ends_with("/finish") || hook.ends_with("/complete")
}

/// Deterministic name for a sync of `kind` configured with `settings`:
/// `{kind}-{first 12 hex chars of sha256(settings)}`.
pub fn stable_sync_name(kind: &str, settings: &Value) -> String {
    let digest = hex::encode(Sha256::digest(settings.to_string().as_bytes()));
    format!("{kind}-{}", &digest[..12])
}
