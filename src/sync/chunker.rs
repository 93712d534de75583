//! Splits item streams into persisted chunks and runs them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde_json::{json, Value};

use crate::chunk::{encode_items, Chunk, ChunkId, ChunkStatus, ChunkStore};
use crate::clock;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::queue::JobQueue;

use super::{run_chunk_hook, ChunkedSync};

/// Number of chunks scheduled so far. Clones share the count.
#[derive(Clone, Debug, Default)]
pub struct ChunkCounter(Arc<AtomicUsize>);

impl ChunkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Increments and returns the new count.
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScheduleOptions {
    /// Overrides the configured `chunk_limit`.
    pub limit: Option<usize>,
    /// Counter to charge instead of the chunker's per-group one.
    pub counter: Option<ChunkCounter>,
}

pub struct Chunker {
    sync: Arc<dyn ChunkedSync>,
    store: Arc<dyn ChunkStore>,
    queue: Arc<dyn JobQueue>,
    config: SyncConfig,
    counters: Mutex<HashMap<String, ChunkCounter>>,
}

impl Chunker {
    pub fn new(
        sync: Arc<dyn ChunkedSync>,
        store: Arc<dyn ChunkStore>,
        queue: Arc<dyn JobQueue>,
        config: SyncConfig,
    ) -> Self {
        Self {
            sync,
            store,
            queue,
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// The chunker's own counter for `group`.
    pub fn group_counter(&self, group: &str) -> ChunkCounter {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.entry(group.to_string()).or_default().clone()
    }

    /// Drops the per-group counter for a finished group.
    pub fn forget_group(&self, group: &str) {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.remove(group);
    }

    /// Number of groups with a live per-group counter.
    pub fn tracked_groups(&self) -> usize {
        match self.counters.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Persists `items` as one `Scheduled` chunk and enqueues its run action.
    ///
    /// Returns `Ok(None)` without writing anything when the chunk limit is
    /// already reached; the items are dropped.
    pub fn schedule_chunk<I, K>(
        &self,
        group: &str,
        items: I,
        options: &ScheduleOptions,
    ) -> Result<Option<ChunkId>>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let counter = options
            .counter
            .clone()
            .unwrap_or_else(|| self.group_counter(group));
        let scheduled = counter.increment();
        if let Some(limit) = options.limit.or(self.config.chunk_limit) {
            if scheduled > limit {
                debug!(
                    "{}: chunk limit {} reached for group '{}', dropping chunk",
                    self.sync.name(),
                    limit,
                    group
                );
                return Ok(None);
            }
        }

        let (data, count) = encode_items(items)?;
        let chunk_id = self.store.save(&Chunk::new(group, data))?;

        let hook = run_chunk_hook(self.sync.name());
        if let Err(err) = self
            .queue
            .enqueue_async(&hook, json!({ "chunk_id": chunk_id }), group)
        {
            warn!(
                "{}: enqueue failed for chunk {}: {}",
                self.sync.name(),
                chunk_id,
                err
            );
            self.store
                .transition(chunk_id, ChunkStatus::Failed, clock::now())?;
            return Err(err);
        }
        debug!(
            "{}: scheduled chunk {} ({} items) in group '{}'",
            self.sync.name(),
            chunk_id,
            count,
            group
        );
        Ok(Some(chunk_id))
    }

    /// Splits `items` into chunks of `chunk_size` and schedules each one.
    /// Returns the ids of the chunks that were scheduled.
    pub fn schedule_items<I, K>(
        &self,
        group: &str,
        items: I,
        options: &ScheduleOptions,
    ) -> Result<Vec<ChunkId>>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut ids = Vec::new();
        let mut batch: Vec<(String, Value)> = Vec::with_capacity(self.config.chunk_size);
        for (key, value) in items {
            batch.push((key.into(), value));
            if batch.len() == self.config.chunk_size {
                ids.extend(self.schedule_chunk(group, std::mem::take(&mut batch), options)?);
            }
        }
        if !batch.is_empty() {
            ids.extend(self.schedule_chunk(group, batch, options)?);
        }
        Ok(ids)
    }

    /// Moves the chunk to `Running` and hands its items to the sync.
    ///
    /// Chunks already in a terminal status are skipped. Processing errors are
    /// returned unchanged.
    pub fn run_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let chunk = self
            .store
            .get(chunk_id)?
            .ok_or_else(|| SyncError::NotFound(format!("chunk {chunk_id}")))?;
        if chunk.status.is_terminal() {
            debug!(
                "{}: chunk {} already {}, skipping",
                self.sync.name(),
                chunk_id,
                chunk.status
            );
            return Ok(());
        }
        if !self
            .store
            .transition(chunk_id, ChunkStatus::Running, clock::now())?
        {
            // Refused: either a retry of a chunk already running, or the chunk
            // was cancelled or timed out since it was read.
            let current = self.store.get(chunk_id)?.map(|c| c.status);
            if current.map_or(true, |s| s.is_terminal()) {
                debug!(
                    "{}: chunk {} became {:?} before running, skipping",
                    self.sync.name(),
                    chunk_id,
                    current
                );
                return Ok(());
            }
        }
        self.sync.process(chunk.items()?)
    }
}
