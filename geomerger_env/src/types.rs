//! Common types for the environment abstraction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a stream on the bus, `<prefix>:<stream_id>`.
///
/// Input streams are addressed as `objecttracker:<camera>`, the merged
/// output as `geomerger:<output_stream_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub prefix: String,
    pub stream_id: String,
}

impl StreamKey {
    /// Creates a key from its two parts.
    pub fn new(prefix: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            stream_id: stream_id.into(),
        }
    }

    /// Parses `prefix:stream_id`. Keys without a separator get an empty prefix.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((prefix, stream_id)) => Self::new(prefix, stream_id),
            None => Self::new("", raw),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "{}", self.stream_id)
        } else {
            write!(f, "{}:{}", self.prefix, self.stream_id)
        }
    }
}

/// A record as it travels over the bus: the stream it belongs to plus the
/// opaque encoded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRecord {
    pub key: StreamKey,
    pub payload: Vec<u8>,
}

impl BusRecord {
    /// Creates a new record.
    pub fn new(key: StreamKey, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
