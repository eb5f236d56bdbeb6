//! Core environment context trait for the merging engines.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// The central interface for time.
///
/// This trait abstracts the "real world" clock so that the identity
/// expiration sweep and the world model's virtual clock can run in both
/// production (tokio) and simulation (manual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `std::time::Instant` and `tokio::time`
/// - **Simulation**: `SimContext` - a virtual clock advanced by the harness
#[async_trait]
pub trait MergerContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for last-seen bookkeeping, sweep rate limiting and the
    /// elapsed-time component of the world model clock.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);
}
