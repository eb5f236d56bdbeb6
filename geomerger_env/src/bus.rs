//! Message bus abstraction for the merger stage.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::StreamKey;
use std::time::Duration;

/// Abstraction for the stream broker the stage reads from and writes to.
///
/// # Implementations
///
/// - **Production**: wraps a stream broker client (one consumer over all
///   configured input streams, one publisher)
/// - **Simulation**: channel-based, see `geomerger_sim::SimBus`
///
/// # Record Flow
///
/// ```text
/// Detector A ──┐
///              ├──> [input streams] ──recv()──> Stage ──publish()──> [output stream]
/// Detector B ──┘
/// ```
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Waits up to `timeout` for the next record on any input stream.
    ///
    /// # Returns
    /// * `Ok(Some((key, payload)))` - A record was received
    /// * `Ok(None)` - Nothing arrived within `timeout`
    /// * `Err(EnvError::Closed)` - The bus was shut down
    async fn recv(&self, timeout: Duration) -> Result<Option<(StreamKey, Vec<u8>)>, EnvError>;

    /// Publishes an encoded payload to the given stream.
    ///
    /// # Returns
    /// * `Ok(())` - Record handed to the broker
    /// * `Err(EnvError::BusError)` - Immediate publish failure
    async fn publish(&self, key: StreamKey, payload: Vec<u8>) -> Result<(), EnvError>;
}
