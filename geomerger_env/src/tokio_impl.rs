//! Production MergerContext on the OS clock and Tokio timers.

use crate::MergerContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Production context.
///
/// Wall-clock time is anchored once at construction and then advanced by the
/// monotonic clock, so `system_time()` never steps backwards when the host
/// clock is adjusted while the stage is running.
#[derive(Debug, Clone)]
pub struct TokioContext {
    started: Instant,
    started_at: SystemTime,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing between the stage and its merger.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Milliseconds since the unix epoch, as stamped on frames.
    pub fn epoch_ms(&self) -> i64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MergerContext for TokioContext {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.started_at + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
