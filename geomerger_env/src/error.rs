//! Error types for the environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Publishing or consuming failed (broker refused, buffer full, ...)
    #[error("Bus error: {0}")]
    BusError(String),

    /// The bus was shut down while an operation was pending
    #[error("Bus closed")]
    Closed,

    /// Payload serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a bus error.
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::BusError(msg.into())
    }

    /// Creates a serialization error.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::SerializationError(err.to_string())
    }
}
