//! In-memory message bus with fault injection.

use async_trait::async_trait;
use geomerger_env::{BusRecord, EnvError, MessageBus, StreamKey};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Simulated stream broker.
///
/// Records injected by the test harness are delivered in order to `recv`;
/// everything the stage publishes is captured for inspection.
pub struct SimBus {
    /// Sender side of the input streams, `None` once closed
    injector: Mutex<Option<mpsc::UnboundedSender<BusRecord>>>,

    /// Receiver for incoming records (behind tokio mutex for async)
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<BusRecord>>,

    /// Records published by the stage
    published: Mutex<Vec<BusRecord>>,

    /// Fraction of injected records silently lost (0.0 - 1.0)
    drop_rate: Mutex<f64>,

    /// RNG deciding which records are lost
    rng: Mutex<ChaCha8Rng>,

    dropped: Mutex<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimBus {
    /// Creates a new bus whose losses are drawn from `seed`.
    pub fn new(seed: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            injector: Mutex::new(Some(tx)),
            inbox: tokio::sync::Mutex::new(rx),
            published: Mutex::new(Vec::new()),
            drop_rate: Mutex::new(0.0),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            dropped: Mutex::new(0),
        }
    }

    /// Creates an Arc-wrapped bus for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Sets the loss rate for injected records.
    pub fn set_drop_rate(&self, rate: f64) {
        *lock(&self.drop_rate) = rate.clamp(0.0, 1.0);
    }

    /// Offers a record to the input streams.
    ///
    /// Returns `Ok(false)` if the record was lost to fault injection.
    pub fn inject(&self, record: BusRecord) -> Result<bool, EnvError> {
        let rate = *lock(&self.drop_rate);
        if rate > 0.0 && lock(&self.rng).gen_bool(rate) {
            *lock(&self.dropped) += 1;
            return Ok(false);
        }

        match lock(&self.injector).as_ref() {
            Some(tx) => tx.send(record).map(|_| true).map_err(|_| EnvError::Closed),
            None => Err(EnvError::Closed),
        }
    }

    /// Closes the input side; `recv` reports `Closed` once drained.
    pub fn close(&self) {
        lock(&self.injector).take();
    }

    /// Returns everything published so far.
    pub fn published(&self) -> Vec<BusRecord> {
        lock(&self.published).clone()
    }

    /// Returns and clears the published records.
    pub fn take_published(&self) -> Vec<BusRecord> {
        std::mem::take(&mut *lock(&self.published))
    }

    pub fn dropped(&self) -> u64 {
        *lock(&self.dropped)
    }
}

#[async_trait]
impl MessageBus for SimBus {
    async fn recv(&self, timeout: Duration) -> Result<Option<(StreamKey, Vec<u8>)>, EnvError> {
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(record)) => Ok(Some((record.key, record.payload))),
            Ok(None) => Err(EnvError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn publish(&self, key: StreamKey, payload: Vec<u8>) -> Result<(), EnvError> {
        lock(&self.published).push(BusRecord::new(key, payload));
        Ok(())
    }
}
