//! Virtual time for deterministic merger runs.

use async_trait::async_trait;
use geomerger_env::MergerContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix milliseconds of virtual time zero (2024-01-01 00:00:00 UTC).
const EPOCH_MS: u64 = 1_704_067_200_000;

/// Deterministic clock and entropy for one simulation run.
///
/// Clones share the virtual clock, so the harness advances the same time
/// the merger reads. Sleeping advances the clock instead of waiting.
#[derive(Debug, Clone)]
pub struct SimContext {
    seed: u64,

    /// Nanoseconds since simulation start
    virtual_time_ns: Arc<AtomicU64>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn advance_time(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_time(&self, time_ns: u64) {
        self.virtual_time_ns.store(time_ns, Ordering::SeqCst);
    }

    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.load(Ordering::SeqCst)
    }

    /// Virtual wall-clock time in unix milliseconds, as stamped on
    /// simulated camera frames.
    pub fn epoch_ms(&self) -> i64 {
        (EPOCH_MS + self.time_ns() / 1_000_000) as i64
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Independent RNG stream for one purpose (noise, ids, frame loss).
    pub fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_mul(0x517c_c1b7_2722_0a95) ^ stream)
    }
}

#[async_trait]
impl MergerContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(EPOCH_MS) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
    }
}
