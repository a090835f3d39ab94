//! Process-relative clock used for tick heartbeats.

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the clock was first read, masked to a non-negative `i32`.
///
/// Wraps roughly every 24.8 days, like the client's own tick counter.
pub fn tick_count() -> i32 {
    let millis = EPOCH.elapsed().as_millis() as u64;
    (millis & i32::MAX as u64) as i32
}
