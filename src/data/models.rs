use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A small named value with optional expiry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NamedRecord {
    pub name: String,
    pub value: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NamedRecord {
    pub fn new(name: impl Into<String>, value: Value, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            value,
            expires_at,
        }
    }

    /// Records expire at `expires_at` inclusive.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    #[test]
    fn record_without_expiry_never_expires() {
        let now = Utc::now();
        let record = NamedRecord::new("feed/run-1/pending", json!([1]), None);
        assert!(!record.is_expired(now + Duration::days(365)));

        let record = NamedRecord::new("k", json!({}), Some(now));
        assert!(record.is_expired(now));
        assert!(!record.is_expired(now - Duration::microseconds(1)));
    }
}
