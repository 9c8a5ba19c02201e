//! Wall-clock helpers for message timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

const HIGH_BITS: i64 = 0xFFFF_FFFF_0000_0000_u64 as i64;

/// Milliseconds since the Unix epoch.
pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Rebuild a sender's 64-bit timestamp from the low 32 bits it sent.
///
/// The high 32 bits come from the local clock and the low 32 bits from the
/// sender. Only correct while both clocks sit in the same 2^32 ms window.
pub fn reconcile_timestamp(now_ms: i64, partial: i32) -> i64 {
    (now_ms & HIGH_BITS) | (((partial as i64 & 0xFFFF_FFFF) << 2) >> 2)
}

/// Whether a message stamped `timestamp_ms` is older than `timeout_ms` at `now_ms`.
pub fn is_expired(timestamp_ms: i64, now_ms: i64, timeout_ms: i64) -> bool {
    now_ms.saturating_sub(timestamp_ms) > timeout_ms
}
