//! Manually advanced clock for unit tests.

use async_trait::async_trait;
use geomerger_env::MergerContext;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Default)]
pub(crate) struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub(crate) fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

#[async_trait]
impl MergerContext for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
