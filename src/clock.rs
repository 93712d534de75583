//! Timestamp helpers. Storage keeps integer microseconds.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn dt_to_us(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

pub(crate) fn us_to_dt(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_else(Utc::now)
}

/// `now + ttl`, saturating instead of overflowing for absurd TTLs.
pub(crate) fn expires_at(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - age`, saturating at the minimum representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
