use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

/// Absolute cutoff shared by every agent in one turn.
///
/// Agents see `epoch_ms` on the wire; the server waits on the monotonic
/// `instant` taken at the same moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    instant: Instant,
    epoch_ms: i64,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let epoch_ms = Utc::now().timestamp_millis();
        let instant = Instant::now();
        Self {
            instant: instant + timeout,
            epoch_ms: epoch_ms.saturating_add(timeout.as_millis().min(i64::MAX as u128) as i64),
        }
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn epoch_ms(&self) -> i64 {
        self.epoch_ms
    }

    pub fn remaining(&self) -> Duration {
        self.instant.saturating_duration_since(Instant::now())
    }

    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.instant
    }
}
