//! Reacts to queue callbacks: drives chunk status, emits lifecycle events and
//! detects the end of a group.
//!
//! Group completion is checked after every terminal callback. Several workers
//! may observe "nothing left" at once; the finish action is therefore enqueued
//! with a per-group unique key, and only the queue decides which attempt wins.
//! The process-local guard only saves queue round trips.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::Serialize;
use serde_json::{json, Value};

use crate::chunk::{Chunk, ChunkId, ChunkStatus, ChunkStore};
use crate::clock;
use crate::config::SyncConfig;
use crate::data::SharedState;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, LifecycleEvent, LifecycleEventKind};
use crate::queue::{ActionId, ActionRecord, ActionStatus, JobQueue, QueueListener};

use super::chunker::Chunker;
use super::{finish_hook, finish_unique_key, is_lifecycle_hook, run_chunk_hook, ChunkedSync};

/// Per-status chunk counts for one group.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct GroupSummary {
    pub group: String,
    pub total: usize,
    pub counts: BTreeMap<ChunkStatus, usize>,
    pub done: bool,
}

impl GroupSummary {
    pub fn count(&self, status: ChunkStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

pub struct LifecycleController {
    sync: Arc<dyn ChunkedSync>,
    store: Arc<dyn ChunkStore>,
    queue: Arc<dyn JobQueue>,
    events: Arc<EventBus>,
    config: SyncConfig,
    chunker: Chunker,
    shared: Option<SharedState>,
    finish_fired: Mutex<HashSet<String>>,
}

impl LifecycleController {
    pub fn new(
        sync: Arc<dyn ChunkedSync>,
        store: Arc<dyn ChunkStore>,
        queue: Arc<dyn JobQueue>,
        events: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        let chunker = Chunker::new(sync.clone(), store.clone(), queue.clone(), config.clone());
        Self {
            sync,
            store,
            queue,
            events,
            config,
            chunker,
            shared: None,
            finish_fired: Mutex::new(HashSet::new()),
        }
    }

    /// Enables multi-step producer tracking.
    pub fn with_shared_state(mut self, shared: SharedState) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn name(&self) -> &str {
        self.sync.name()
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn owns(&self, hook: &str) -> bool {
        hook.starts_with(&format!("{}/", self.name()))
    }

    /// Fetches the action and checks it is a chunk action of this sync.
    fn owned_chunk_action(&self, action_id: ActionId) -> Result<Option<ActionRecord>> {
        let Some(action) = self.queue.fetch_action(action_id)? else {
            debug!("{}: unknown action {}", self.name(), action_id);
            return Ok(None);
        };
        if !self.owns(&action.hook) || is_lifecycle_hook(&action.hook) {
            return Ok(None);
        }
        Ok(Some(action))
    }

    /// The chunk bound to `action`, falling back to the id carried in its args.
    fn chunk_for(&self, action: &ActionRecord) -> Result<Option<Chunk>> {
        if let Some(chunk) = self.store.find_by_action(action.id)? {
            return Ok(Some(chunk));
        }
        match action.args.get("chunk_id").and_then(Value::as_i64) {
            Some(chunk_id) => self.store.get(chunk_id),
            None => Ok(None),
        }
    }

    fn emit(&self, event: &LifecycleEvent) {
        let listeners = self.events.emit(event);
        debug!("emitted {} to {} listener(s)", event.name(), listeners);
    }

    /// Persists a terminal status, emits its event and runs the completion check.
    fn handle_terminal(
        &self,
        action_id: ActionId,
        status: ChunkStatus,
        kind: LifecycleEventKind,
        error: Option<&str>,
    ) -> Result<()> {
        let Some(action) = self.owned_chunk_action(action_id)? else {
            return Ok(());
        };
        let Some(chunk) = self.chunk_for(&action)? else {
            debug!("{}: no chunk for action {}", self.name(), action_id);
            return Ok(());
        };
        let chunk_id = chunk_id_of(&chunk)?;
        if !self.store.transition(chunk_id, status, clock::now())? {
            let current = self.store.get(chunk_id)?.map(|c| c.status);
            debug!(
                "{}: chunk {} already {:?}, not re-emitting {}",
                self.name(),
                chunk_id,
                current,
                kind
            );
            // A redelivered callback may follow a failed completion check.
            if current.is_some_and(|s| s.is_terminal()) {
                self.maybe_trigger_finish(&action.group)?;
            }
            return Ok(());
        }
        debug!("{}: chunk {} -> {}", self.name(), chunk_id, status);

        let mut event = LifecycleEvent::new(self.name(), kind, &action.group)
            .with_action(action_id, Some(chunk_id));
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.emit(&event);
        if kind == LifecycleEventKind::Fail {
            self.sync.on_fail(&event);
        }

        self.maybe_trigger_finish(&action.group)?;
        Ok(())
    }

    /// Enqueues the finish action for `group` if nothing is left to run.
    /// Returns the id of the enqueued action, or `None` when the group is not
    /// done or another caller already won.
    pub fn maybe_trigger_finish(&self, group: &str) -> Result<Option<ActionId>> {
        if self.producer_active(group)? {
            debug!("{}: producer of '{}' still running", self.name(), group);
            return Ok(None);
        }
        let outstanding = self.queue.query_actions(
            group,
            &ActionStatus::OUTSTANDING,
            self.config.finish_query_limit,
        )?;
        if !outstanding.is_empty() {
            return Ok(None);
        }
        let (done, has_chunks) = self.store.all_done_in_group(group)?;
        if !(done && has_chunks) {
            return Ok(None);
        }

        if !self.mark_finish_fired(group) {
            debug!("{}: finish for '{}' already fired here", self.name(), group);
            return Ok(None);
        }
        let enqueued = self.queue.enqueue_unique(
            &finish_hook(self.name()),
            json!({ "group": group }),
            group,
            &finish_unique_key(self.name(), group),
        );
        match enqueued {
            Ok(Some(action_id)) => {
                info!(
                    "{}: group '{}' done, finish action {}",
                    self.name(),
                    group,
                    action_id
                );
                Ok(Some(action_id))
            }
            Ok(None) => {
                debug!("{}: finish for '{}' already queued", self.name(), group);
                self.clear_finish_fired(group);
                Ok(None)
            }
            Err(err) => {
                self.clear_finish_fired(group);
                Err(err)
            }
        }
    }

    /// Groups this controller has enqueued a finish for and not yet finished.
    pub fn pending_finishes(&self) -> usize {
        match self.finish_fired.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn mark_finish_fired(&self, group: &str) -> bool {
        let mut fired = match self.finish_fired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        fired.insert(group.to_string())
    }

    fn clear_finish_fired(&self, group: &str) {
        let mut fired = match self.finish_fired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        fired.remove(group);
    }

    /// Runs an action of this sync: a chunk or the group finish.
    pub fn execute(&self, action: &ActionRecord) -> Result<()> {
        if action.hook == run_chunk_hook(self.name()) {
            let chunk_id = action
                .args
                .get("chunk_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| SyncError::Queue(format!("action {} has no chunk_id", action.id)))?;
            return self.chunker.run_chunk(chunk_id);
        }
        if action.hook == finish_hook(self.name()) {
            let group = action
                .args
                .get("group")
                .and_then(Value::as_str)
                .unwrap_or(action.group.as_str());
            self.finish_group(group);
            return Ok(());
        }
        Err(SyncError::NotFound(format!(
            "{}: no handler for hook '{}'",
            self.name(),
            action.hook
        )))
    }

    fn finish_group(&self, group: &str) {
        info!("{}: finishing group '{}'", self.name(), group);
        self.clear_finish_fired(group);
        self.chunker.forget_group(group);
        self.emit(&LifecycleEvent::new(
            self.name(),
            LifecycleEventKind::Finish,
            group,
        ));
        self.sync.on_finish(group);
    }

    fn producer_key(&self, group: &str) -> String {
        format!("{}/{}/producer", self.name(), group)
    }

    fn shared(&self) -> Result<&SharedState> {
        self.shared.as_ref().ok_or_else(|| {
            SyncError::Config(format!(
                "{}: producer tracking needs shared state",
                self.name()
            ))
        })
    }

    /// Records that a multi-step producer is still scheduling chunks for `group`.
    /// Finish is deferred until [`LifecycleController::producer_finished`].
    pub fn producer_started(&self, group: &str) -> Result<()> {
        self.shared()?.update_merged(
            &self.producer_key(group),
            &json!({ "started": true, "finished": false }),
            false,
            false,
            None,
        )?;
        Ok(())
    }

    /// Records the end of scheduling for `group` and re-runs the completion check.
    pub fn producer_finished(&self, group: &str) -> Result<Option<ActionId>> {
        self.shared()?.update_merged(
            &self.producer_key(group),
            &json!({ "finished": true }),
            false,
            false,
            None,
        )?;
        self.maybe_trigger_finish(group)
    }

    fn producer_active(&self, group: &str) -> Result<bool> {
        let Some(shared) = &self.shared else {
            return Ok(false);
        };
        let Some(record) = shared.get(&self.producer_key(group))? else {
            return Ok(false);
        };
        let flag = |name: &str| record.get(name).and_then(Value::as_bool).unwrap_or(false);
        Ok(flag("started") && !flag("finished"))
    }

    pub fn summary(&self, group: &str) -> Result<GroupSummary> {
        let mut summary = GroupSummary {
            group: group.to_string(),
            ..Default::default()
        };
        for status in ChunkStatus::ALL {
            let count = self.store.count_by_group_and_status(group, &[status])?;
            if count > 0 {
                summary.counts.insert(status, count);
            }
            summary.total += count;
        }
        summary.done = summary.total > 0
            && ChunkStatus::ACTIVE
                .iter()
                .all(|status| summary.count(*status) == 0);
        Ok(summary)
    }
}

fn chunk_id_of(chunk: &Chunk) -> Result<ChunkId> {
    chunk
        .id
        .ok_or_else(|| SyncError::NotFound("stored chunk without id".to_string()))
}

impl QueueListener for LifecycleController {
    fn on_begin_execute(&self, action_id: ActionId) -> Result<()> {
        let Some(action) = self.owned_chunk_action(action_id)? else {
            return Ok(());
        };
        let Some(mut chunk) = self.chunk_for(&action)? else {
            debug!("{}: no chunk for action {}", self.name(), action_id);
            return Ok(());
        };
        let chunk_id = chunk_id_of(&chunk)?;
        let now = clock::now();
        if !self.store.transition(chunk_id, ChunkStatus::Started, now)? {
            debug!(
                "{}: chunk {} is {}, not starting",
                self.name(),
                chunk_id,
                chunk.status
            );
            return Ok(());
        }
        if chunk.action_id != Some(action_id) {
            chunk.action_id = Some(action_id);
            chunk.apply_transition(ChunkStatus::Started, now);
            self.store.save(&chunk)?;
        }
        debug!("{}: chunk {} started by action {}", self.name(), chunk_id, action_id);

        let event = LifecycleEvent::new(self.name(), LifecycleEventKind::Start, &action.group)
            .with_action(action_id, Some(chunk_id));
        self.emit(&event);
        self.sync.on_start(&event);
        Ok(())
    }

    fn on_completed(&self, action_id: ActionId) -> Result<()> {
        self.handle_terminal(
            action_id,
            ChunkStatus::Finished,
            LifecycleEventKind::Complete,
            None,
        )
    }

    fn on_failed_execution(&self, action_id: ActionId, error: &str) -> Result<()> {
        self.handle_terminal(
            action_id,
            ChunkStatus::Failed,
            LifecycleEventKind::Fail,
            Some(error),
        )
    }

    fn on_failed_timeout(&self, action_id: ActionId) -> Result<()> {
        self.handle_terminal(
            action_id,
            ChunkStatus::TimedOut,
            LifecycleEventKind::Timeout,
            None,
        )
    }

    fn on_cancelled(&self, action_id: ActionId) -> Result<()> {
        self.handle_terminal(
            action_id,
            ChunkStatus::Cancelled,
            LifecycleEventKind::Cancel,
            None,
        )
    }
}
