//! Error type shared by every chunk-sync component.

use thiserror::Error;

/// Errors surfaced by chunk stores, the keyed data store, the chunker and the
/// lifecycle controller.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A storage read or write failed.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// The keyed lock could not be acquired within the wait budget. No write was made.
    #[error("timed out after {waited_ms}ms waiting for lock '{name}'")]
    LockTimeout { name: String, waited_ms: u64 },
    /// A chunk payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(String),
    /// The external job queue rejected or failed a request.
    #[error("queue error: {0}")]
    Queue(String),
    /// Raised by a host processing function.
    #[error("processing error: {0}")]
    Processing(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Persistence(_))
    }

    pub(crate) fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{context}: {err}"))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_and_persistence_are_retryable() {
        let timeout = SyncError::LockTimeout {
            name: "feed_lock".into(),
            waited_ms: 5000,
        };
        assert!(timeout.is_retryable());
        assert!(SyncError::persistence("save chunk", "disk full").is_retryable());
        assert!(!SyncError::Processing("bad row".into()).is_retryable());
        assert_eq!(
            timeout.to_string(),
            "timed out after 5000ms waiting for lock 'feed_lock'"
        );
    }
}
