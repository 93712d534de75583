//! Contract with the external job queue that executes chunk actions.
//!
//! The queue owns action execution and retries; this crate only enqueues
//! actions, inspects them, and reacts to the callbacks in [`QueueListener`].

pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use memory::InMemoryJobQueue;

pub type ActionId = i64;

/// Status of an external queue action.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Canceled,
}

impl ActionStatus {
    /// Statuses that mean the action may still run.
    pub const OUTSTANDING: [ActionStatus; 2] = [Self::Pending, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action as reported by the queue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub id: ActionId,
    pub hook: String,
    pub group: String,
    pub args: Value,
    pub status: ActionStatus,
    pub unique_key: Option<String>,
}

/// Operations this crate needs from the host's job queue.
pub trait JobQueue: Send + Sync {
    /// At-least-once dispatch of `hook` with `args`, tagged with `group`.
    fn enqueue_async(&self, hook: &str, args: Value, group: &str) -> Result<ActionId>;

    /// Like [`JobQueue::enqueue_async`], but atomically rejected (`Ok(None)`) when an
    /// action with the same `unique_key` is already pending, running or complete.
    fn enqueue_unique(
        &self,
        hook: &str,
        args: Value,
        group: &str,
        unique_key: &str,
    ) -> Result<Option<ActionId>>;

    fn fetch_action(&self, action_id: ActionId) -> Result<Option<ActionRecord>>;

    /// Ids of actions in `group` whose status is in `statuses`, at most `limit`.
    fn query_actions(
        &self,
        group: &str,
        statuses: &[ActionStatus],
        limit: usize,
    ) -> Result<Vec<ActionId>>;
}

/// Callbacks the queue delivers while it executes actions.
///
/// Queues must record the action's final status before invoking
/// `on_completed`, `on_failed_execution`, `on_failed_timeout` or `on_cancelled`.
pub trait QueueListener: Send + Sync {
    fn on_begin_execute(&self, action_id: ActionId) -> Result<()>;
    fn on_completed(&self, action_id: ActionId) -> Result<()>;
    fn on_failed_execution(&self, action_id: ActionId, error: &str) -> Result<()>;
    fn on_failed_timeout(&self, action_id: ActionId) -> Result<()>;
    fn on_cancelled(&self, action_id: ActionId) -> Result<()>;
}
