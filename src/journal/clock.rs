//! Monotonic timestamp source for checkpoint heartbeats.

use std::time::Instant;

/// Wall-anchored steady clock.
///
/// Captures the wall unix time once at construction and advances it with
/// `Instant` elapsed time, so NTP steps or manual clock changes after startup
/// cannot move heartbeats backwards or jump them forwards.
#[derive(Debug, Clone)]
pub struct SteadyClock {
    anchor_unix_ms: i64,
    anchor: Instant,
}

impl SteadyClock {
    pub fn new() -> Self {
        Self {
            anchor_unix_ms: chrono::Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }

    /// Milliseconds since the unix epoch, monotonic within this process.
    pub fn now_ms(&self) -> i64 {
        self.anchor_unix_ms + self.anchor.elapsed().as_millis() as i64
    }
}

impl Default for SteadyClock {
    fn default() -> Self {
        Self::new()
    }
}
