//! Chunk records and their lifecycle status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::queue::ActionId;

use super::payload::{decode_items, ChunkItems};

pub type ChunkId = i64;

/// Lifecycle status of a chunk. Terminal statuses never change again.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkStatus {
    Scheduled,
    Started,
    Running,
    Finished,
    Failed,
    Cancelled,
    TimedOut,
}

impl ChunkStatus {
    pub const ALL: [ChunkStatus; 7] = [
        Self::Scheduled,
        Self::Started,
        Self::Running,
        Self::Finished,
        Self::Failed,
        Self::Cancelled,
        Self::TimedOut,
    ];

    /// Statuses that still count against group completion.
    pub const ACTIVE: [ChunkStatus; 3] = [Self::Scheduled, Self::Started, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(Self::Scheduled),
            "started" => Some(Self::Started),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "timed_out" | "timedout" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Scheduled => 0,
            Self::Started => 1,
            Self::Running => 2,
            _ => 3,
        }
    }

    /// Forward-only: `Scheduled -> Started -> Running -> terminal`, steps may be skipped.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Every status `next` may be reached from.
    pub fn predecessors(next: ChunkStatus) -> Vec<ChunkStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of schedulable work.
///
/// `id` is assigned by the store on first save. `data` holds the encoded
/// payload (see [`super::payload`]).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: Option<ChunkId>,
    pub action_id: Option<ActionId>,
    pub group: String,
    pub status: ChunkStatus,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn new(group: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: None,
            action_id: None,
            group: group.into(),
            status: ChunkStatus::Scheduled,
            data: data.into(),
            created_at: clock::now(),
            start: None,
            end: None,
        }
    }

    /// Lazily decoded payload items.
    pub fn items(&self) -> crate::Result<ChunkItems<'_>> {
        decode_items(&self.data)
    }

    /// Applies a transition in memory, mirroring what stores persist.
    /// Returns `false` and leaves the chunk untouched when the move is not allowed.
    pub fn apply_transition(&mut self, next: ChunkStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            ChunkStatus::Started => self.start = Some(at),
            ChunkStatus::Running => {
                self.start.get_or_insert(at);
            }
            _ => {
                self.start.get_or_insert(at);
                self.end = Some(at);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(ChunkStatus::Scheduled.can_transition_to(ChunkStatus::Started));
        assert!(ChunkStatus::Scheduled.can_transition_to(ChunkStatus::Cancelled));
        assert!(ChunkStatus::Started.can_transition_to(ChunkStatus::Running));
        assert!(!ChunkStatus::Running.can_transition_to(ChunkStatus::Started));
        assert!(!ChunkStatus::Running.can_transition_to(ChunkStatus::Running));
        for terminal in [
            ChunkStatus::Finished,
            ChunkStatus::Failed,
            ChunkStatus::Cancelled,
            ChunkStatus::TimedOut,
        ] {
            for next in ChunkStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn predecessors_of_finished_are_the_active_statuses() {
        assert_eq!(
            ChunkStatus::predecessors(ChunkStatus::Finished),
            ChunkStatus::ACTIVE.to_vec()
        );
        assert_eq!(
            ChunkStatus::predecessors(ChunkStatus::Started),
            vec![ChunkStatus::Scheduled]
        );
    }

    #[test]
    fn status_strings_parse_back() {
        for status in ChunkStatus::ALL {
            assert_eq!(ChunkStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ChunkStatus::parse("Canceled"), Some(ChunkStatus::Cancelled));
        assert_eq!(ChunkStatus::parse("pending"), None);
    }

    #[test]
    fn terminal_transition_sets_end_after_start() {
        let mut chunk = Chunk::new("g", "");
        let t0 = clock::now();
        assert!(chunk.apply_transition(ChunkStatus::Cancelled, t0));
        assert_eq!(chunk.start, Some(t0));
        assert_eq!(chunk.end, Some(t0));
        assert!(!chunk.apply_transition(ChunkStatus::Finished, t0));
        assert_eq!(chunk.status, ChunkStatus::Cancelled);
    }
}
