//! Typed lifecycle event bus.
//!
//! Listeners subscribe to a `{sync}/{event}` routing key and are invoked
//! synchronously, in registration order, on the emitting thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkId;
use crate::queue::ActionId;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LifecycleEventKind {
    Start,
    Complete,
    Finish,
    Fail,
    Cancel,
    Timeout,
}

impl LifecycleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Finish => "finish",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{sync}/{event}`.
pub fn event_name(sync_name: &str, kind: LifecycleEventKind) -> String {
    format!("{}/{}", sync_name, kind.as_str())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub sync: String,
    pub kind: LifecycleEventKind,
    pub group: String,
    pub action_id: Option<ActionId>,
    pub chunk_id: Option<ChunkId>,
    pub error: Option<String>,
}

impl LifecycleEvent {
    pub fn new(sync: impl Into<String>, kind: LifecycleEventKind, group: impl Into<String>) -> Self {
        Self {
            sync: sync.into(),
            kind,
            group: group.into(),
            action_id: None,
            chunk_id: None,
            error: None,
        }
    }

    pub fn with_action(mut self, action_id: ActionId, chunk_id: Option<ChunkId>) -> Self {
        self.action_id = Some(action_id);
        self.chunk_id = chunk_id;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn name(&self) -> String {
        event_name(&self.sync, self.kind)
    }
}

pub type EventListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners
            .entry(name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Delivers `event` to every listener of its name. Returns how many ran.
    pub fn emit(&self, event: &LifecycleEvent) -> usize {
        let name = event.name();
        // Snapshot so listeners may subscribe or emit without deadlocking.
        let snapshot: Vec<EventListener> = {
            let listeners = match self.listeners.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners.get(&name).cloned().unwrap_or_default()
        };
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners
            .read()
            .map(|l| l.get(name).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}
