//! Storage contract for chunk records.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::queue::ActionId;

use super::models::{Chunk, ChunkId, ChunkStatus};

/// Chunk persistence used by the chunker and the lifecycle controller.
pub trait ChunkStore: Send + Sync {
    /// Insert or update by id. `None` optional fields never clear stored values,
    /// and the stored status only ever moves forward.
    fn save(&self, chunk: &Chunk) -> Result<ChunkId>;

    /// Fully populated chunk by primary key.
    fn get(&self, id: ChunkId) -> Result<Option<Chunk>>;

    /// Chunk bound to an external queue action.
    fn find_by_action(&self, action_id: ActionId) -> Result<Option<Chunk>>;

    /// Chunks of a group, ordered by id. An empty `statuses` slice means all.
    fn list_by_group_and_status(&self, group: &str, statuses: &[ChunkStatus])
        -> Result<Vec<Chunk>>;

    fn count_by_group_and_status(&self, group: &str, statuses: &[ChunkStatus]) -> Result<usize>;

    /// Conditional status update; refuses to leave a terminal status or move backwards.
    /// Returns whether the row changed.
    fn transition(&self, id: ChunkId, to: ChunkStatus, at: DateTime<Utc>) -> Result<bool>;

    /// Deletes chunks whose start (or creation, when never started) is older than
    /// `older_than` relative to `now`, optionally restricted to one status.
    fn cleanup(
        &self,
        older_than: Duration,
        status: Option<ChunkStatus>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    fn count_by_group(&self, group: &str) -> Result<usize> {
        self.count_by_group_and_status(group, &[])
    }

    /// `(done, has_chunks)`: done is true iff the group has chunks and none is active.
    fn all_done_in_group(&self, group: &str) -> Result<(bool, bool)> {
        let total = self.count_by_group(group)?;
        if total == 0 {
            return Ok((false, false));
        }
        let active = self.count_by_group_and_status(group, &ChunkStatus::ACTIVE)?;
        Ok((active == 0, true))
    }
}
