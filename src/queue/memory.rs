//! In-process job queue with unique-key dedup and a small worker driver.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use serde_json::Value;

use crate::error::{Result, SyncError};

use super::{ActionId, ActionRecord, ActionStatus, JobQueue, QueueListener};

#[derive(Default)]
struct QueueState {
    next_id: ActionId,
    actions: BTreeMap<ActionId, ActionRecord>,
}

/// FIFO queue kept in memory. Workers on several threads may share it.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Queue("in-memory queue lock poisoned".to_string()))
    }

    fn push(
        state: &mut QueueState,
        hook: &str,
        args: Value,
        group: &str,
        unique_key: Option<String>,
    ) -> ActionId {
        state.next_id += 1;
        let id = state.next_id;
        state.actions.insert(
            id,
            ActionRecord {
                id,
                hook: hook.to_string(),
                group: group.to_string(),
                args,
                status: ActionStatus::Pending,
                unique_key,
            },
        );
        id
    }

    /// Moves the oldest pending action to `Running` and returns it.
    pub fn claim_next(&self) -> Result<Option<ActionRecord>> {
        let mut state = self.state()?;
        let Some(action) = state
            .actions
            .values_mut()
            .find(|a| a.status == ActionStatus::Pending)
        else {
            return Ok(None);
        };
        action.status = ActionStatus::Running;
        Ok(Some(action.clone()))
    }

    pub fn set_status(&self, action_id: ActionId, status: ActionStatus) -> Result<()> {
        let mut state = self.state()?;
        let action = state
            .actions
            .get_mut(&action_id)
            .ok_or_else(|| SyncError::NotFound(format!("action {action_id}")))?;
        action.status = status;
        Ok(())
    }

    /// Claims one action, reports it to `listener` and runs it with `execute`,
    /// recording the final status before the completion callback.
    /// Returns the id of the action that ran, or `None` when nothing was pending.
    pub fn run_next<F>(&self, listener: &dyn QueueListener, execute: F) -> Result<Option<ActionId>>
    where
        F: FnOnce(&ActionRecord) -> Result<()>,
    {
        let Some(action) = self.claim_next()? else {
            return Ok(None);
        };
        listener.on_begin_execute(action.id)?;
        match execute(&action) {
            Ok(()) => {
                self.set_status(action.id, ActionStatus::Complete)?;
                listener.on_completed(action.id)?;
            }
            Err(err) => {
                debug!("action {} ({}) failed: {}", action.id, action.hook, err);
                self.set_status(action.id, ActionStatus::Failed)?;
                listener.on_failed_execution(action.id, &err.to_string())?;
            }
        }
        Ok(Some(action.id))
    }

    /// Cancels a pending action and notifies `listener`. Returns whether it was pending.
    pub fn cancel(&self, action_id: ActionId, listener: &dyn QueueListener) -> Result<bool> {
        {
            let mut state = self.state()?;
            match state.actions.get_mut(&action_id) {
                Some(action) if action.status == ActionStatus::Pending => {
                    action.status = ActionStatus::Canceled;
                }
                _ => return Ok(false),
            }
        }
        listener.on_cancelled(action_id)?;
        Ok(true)
    }

    /// Marks a running action as timed out and notifies `listener`.
    pub fn time_out(&self, action_id: ActionId, listener: &dyn QueueListener) -> Result<bool> {
        {
            let mut state = self.state()?;
            match state.actions.get_mut(&action_id) {
                Some(action) if action.status == ActionStatus::Running => {
                    action.status = ActionStatus::Failed;
                }
                _ => return Ok(false),
            }
        }
        listener.on_failed_timeout(action_id)?;
        Ok(true)
    }

    pub fn actions(&self) -> Result<Vec<ActionRecord>> {
        Ok(self.state()?.actions.values().cloned().collect())
    }

    /// Actions whose hook equals `hook`.
    pub fn actions_with_hook(&self, hook: &str) -> Result<Vec<ActionRecord>> {
        Ok(self
            .state()?
            .actions
            .values()
            .filter(|a| a.hook == hook)
            .cloned()
            .collect())
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue_async(&self, hook: &str, args: Value, group: &str) -> Result<ActionId> {
        let mut state = self.state()?;
        Ok(Self::push(&mut state, hook, args, group, None))
    }

    fn enqueue_unique(
        &self,
        hook: &str,
        args: Value,
        group: &str,
        unique_key: &str,
    ) -> Result<Option<ActionId>> {
        let mut state = self.state()?;
        let duplicate = state.actions.values().any(|a| {
            a.unique_key.as_deref() == Some(unique_key)
                && matches!(
                    a.status,
                    ActionStatus::Pending | ActionStatus::Running | ActionStatus::Complete
                )
        });
        if duplicate {
            return Ok(None);
        }
        Ok(Some(Self::push(
            &mut state,
            hook,
            args,
            group,
            Some(unique_key.to_string()),
        )))
    }

    fn fetch_action(&self, action_id: ActionId) -> Result<Option<ActionRecord>> {
        Ok(self.state()?.actions.get(&action_id).cloned())
    }

    fn query_actions(
        &self,
        group: &str,
        statuses: &[ActionStatus],
        limit: usize,
    ) -> Result<Vec<ActionId>> {
        Ok(self
            .state()?
            .actions
            .values()
            .filter(|a| a.group == group && (statuses.is_empty() || statuses.contains(&a.status)))
            .take(limit)
            .map(|a| a.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unique_enqueue_rejects_pending_and_complete_duplicates() {
        let queue = InMemoryJobQueue::new();
        let first = queue
            .enqueue_unique("feed/finish", json!({}), "g", "feed/finish:g")
            .expect("enqueue");
        assert!(first.is_some());
        assert!(queue
            .enqueue_unique("feed/finish", json!({}), "g", "feed/finish:g")
            .expect("dup pending")
            .is_none());

        let first = first.expect("first id");
        queue
            .set_status(first, ActionStatus::Complete)
            .expect("complete");
        assert!(queue
            .enqueue_unique("feed/finish", json!({}), "g", "feed/finish:g")
            .expect("dup complete")
            .is_none());

        queue.set_status(first, ActionStatus::Failed).expect("fail");
        assert!(queue
            .enqueue_unique("feed/finish", json!({}), "g", "feed/finish:g")
            .expect("retry after failure")
            .is_some());
    }

    #[test]
    fn query_actions_filters_by_group_status_and_limit() {
        let queue = InMemoryJobQueue::new();
        for _ in 0..3 {
            queue.enqueue_async("feed/run_chunk", json!({}), "g1").expect("enqueue");
        }
        queue.enqueue_async("feed/run_chunk", json!({}), "g2").expect("enqueue");
        let claimed = queue.claim_next().expect("claim").expect("action");
        assert_eq!(claimed.status, ActionStatus::Running);

        let outstanding = queue
            .query_actions("g1", &ActionStatus::OUTSTANDING, 10)
            .expect("query");
        assert_eq!(outstanding.len(), 3);
        let one = queue
            .query_actions("g1", &ActionStatus::OUTSTANDING, 1)
            .expect("query limited");
        assert_eq!(one, vec![claimed.id]);
        let running = queue
            .query_actions("g1", &[ActionStatus::Running], 10)
            .expect("query running");
        assert_eq!(running, vec![claimed.id]);
    }
}
