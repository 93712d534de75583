//! In-process chunk store. Useful for tests and single-process hosts.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock;
use crate::error::{Result, SyncError};
use crate::queue::ActionId;

use super::models::{Chunk, ChunkId, ChunkStatus};
use super::store::ChunkStore;

#[derive(Default)]
struct Rows {
    next_id: ChunkId,
    chunks: BTreeMap<ChunkId, Chunk>,
}

#[derive(Default)]
pub struct InMemoryChunkStore {
    rows: Mutex<Rows>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, Rows>> {
        self.rows
            .lock()
            .map_err(|_| SyncError::Persistence("in-memory chunk store lock poisoned".to_string()))
    }
}

fn matches_status(chunk: &Chunk, statuses: &[ChunkStatus]) -> bool {
    statuses.is_empty() || statuses.contains(&chunk.status)
}

impl ChunkStore for InMemoryChunkStore {
    fn save(&self, chunk: &Chunk) -> Result<ChunkId> {
        let mut rows = self.rows()?;
        let id = match chunk.id {
            Some(id) => id,
            None => {
                rows.next_id += 1;
                rows.next_id
            }
        };
        rows.next_id = rows.next_id.max(id);
        match rows.chunks.get_mut(&id) {
            Some(stored) => {
                if chunk.action_id.is_some() {
                    stored.action_id = chunk.action_id;
                }
                if stored.status.can_transition_to(chunk.status) {
                    stored.status = chunk.status;
                }
                stored.group = chunk.group.clone();
                stored.data = chunk.data.clone();
                if chunk.start.is_some() {
                    stored.start = chunk.start;
                }
                if chunk.end.is_some() {
                    stored.end = chunk.end;
                }
            }
            None => {
                let mut stored = chunk.clone();
                stored.id = Some(id);
                rows.chunks.insert(id, stored);
            }
        }
        Ok(id)
    }

    fn get(&self, id: ChunkId) -> Result<Option<Chunk>> {
        Ok(self.rows()?.chunks.get(&id).cloned())
    }

    fn find_by_action(&self, action_id: ActionId) -> Result<Option<Chunk>> {
        Ok(self
            .rows()?
            .chunks
            .values()
            .find(|c| c.action_id == Some(action_id))
            .cloned())
    }

    fn list_by_group_and_status(
        &self,
        group: &str,
        statuses: &[ChunkStatus],
    ) -> Result<Vec<Chunk>> {
        Ok(self
            .rows()?
            .chunks
            .values()
            .filter(|c| c.group == group && matches_status(c, statuses))
            .cloned()
            .collect())
    }

    fn count_by_group_and_status(&self, group: &str, statuses: &[ChunkStatus]) -> Result<usize> {
        Ok(self
            .rows()?
            .chunks
            .values()
            .filter(|c| c.group == group && matches_status(c, statuses))
            .count())
    }

    fn transition(&self, id: ChunkId, to: ChunkStatus, at: DateTime<Utc>) -> Result<bool> {
        let mut rows = self.rows()?;
        match rows.chunks.get_mut(&id) {
            Some(chunk) => Ok(chunk.apply_transition(to, at)),
            None => Ok(false),
        }
    }

    fn cleanup(
        &self,
        older_than: Duration,
        status: Option<ChunkStatus>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cutoff = clock::cutoff(now, older_than);
        let mut rows = self.rows()?;
        let before = rows.chunks.len();
        rows.chunks.retain(|_, c| {
            let reference = c.start.unwrap_or(c.created_at);
            let status_matches = status.map_or(true, |s| s == c.status);
            !(reference < cutoff && status_matches)
        });
        Ok((before - rows.chunks.len()) as u64)
    }
}
