//! Wall-clock helpers for TTL handling.
//!
//! TTLs are stored as absolute UNIX timestamps in seconds, `0` meaning no
//! expiry. Callers that need deterministic behaviour (compaction tests) pass
//! `now` explicitly instead of sampling the clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UNIX time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Absolute expiry for a relative TTL, or 0 when `ttl_secs <= 0`.
pub fn ttl_deadline(now: i64, ttl_secs: i64) -> i64 {
    if ttl_secs > 0 {
        now.saturating_add(ttl_secs)
    } else {
        0
    }
}

/// Whether a stored TTL has passed.
pub fn is_expired(ttl: i64, now: i64) -> bool {
    ttl > 0 && ttl < now
}
