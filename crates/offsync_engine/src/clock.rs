//! Wall-clock time that follows tokio's clock.

use offsync_storage::{Clock, SystemClock};
use tokio::time::Instant;

/// Milliseconds since the Unix epoch, advanced by tokio's clock.
///
/// The wall time is read once at construction; after that the clock moves
/// with [`tokio::time::Instant`]. When a test pauses and advances tokio time,
/// `now_millis` advances with it, so backoff deadlines stored as wall time
/// come due exactly when tokio timers fire.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base_millis: i64,
    base_instant: Instant,
}

impl TokioClock {
    /// Creates a clock anchored at the current wall time.
    pub fn new() -> Self {
        Self {
            base_millis: SystemClock.now_millis(),
            base_instant: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.base_millis + self.base_instant.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = TokioClock::new();
        let start = clock.now_millis();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(clock.now_millis() - start, 2_000);
    }
}
