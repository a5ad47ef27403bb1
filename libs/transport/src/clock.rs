//! Wall-clock helpers for request latency accounting.
//!
//! Process-start timestamps are only ever used for observability, so a
//! wall clock with millisecond resolution is sufficient. Elapsed-time
//! calculations saturate at zero when the system clock steps backwards.

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn current_time_millis() -> u64 {
    // Pre-epoch clocks are clamped rather than wrapped
    Utc::now().timestamp_millis().max(0) as u64
}

/// Milliseconds elapsed since `start_millis`
pub fn elapsed_millis_since(start_millis: u64) -> u64 {
    current_time_millis().saturating_sub(start_millis)
}
