//! Sliding-window event counters
//!
//! A timestamp is inside the window when `ts >= now_ms - window_ms`; the
//! lower bound is inclusive. Comparison is purely numeric, so negative or
//! out-of-order timestamps are tolerated, but callers should append in
//! non-decreasing order.

/// Oldest timestamp still inside the window.
#[inline]
fn cutoff(now_ms: i64, window_ms: i64) -> i64 {
    now_ms.saturating_sub(window_ms)
}

/// Return the timestamps inside the window, preserving order.
#[must_use]
pub fn prune_timestamps(timestamps: &[i64], now_ms: i64, window_ms: i64) -> Vec<i64> {
    let cutoff = cutoff(now_ms, window_ms);
    timestamps.iter().copied().filter(|&ts| ts >= cutoff).collect()
}

/// Drop timestamps older than the window, in place.
///
/// Used on live subject state so the event logs stay bounded.
pub fn prune_timestamps_in_place(timestamps: &mut Vec<i64>, now_ms: i64, window_ms: i64) {
    let cutoff = cutoff(now_ms, window_ms);
    timestamps.retain(|&ts| ts >= cutoff);
}

/// Number of timestamps inside the window.
#[must_use]
pub fn count_in_window(timestamps: &[i64], now_ms: i64, window_ms: i64) -> usize {
    let cutoff = cutoff(now_ms, window_ms);
    timestamps.iter().filter(|&&ts| ts >= cutoff).count()
}
