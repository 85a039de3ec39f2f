use chrono::Utc;
use tokio::time::Instant;

/// Wall-clock source in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Reads the epoch once through chrono and advances it with tokio's
/// monotonic instant, so a paused tokio clock drives it too.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    epoch_ms: u64,
    anchor: Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self {
            epoch_ms: Utc::now().timestamp_millis().max(0) as u64,
            anchor: Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now_ms(&self) -> u64 {
        self.epoch_ms
            .saturating_add(self.anchor.elapsed().as_millis() as u64)
    }
}
