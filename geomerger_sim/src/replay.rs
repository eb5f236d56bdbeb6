//! Offline replay of recorded camera frames.
//!
//! Reads one JSON-encoded frame per line, drives the configured merger on a
//! [`SimContext`] whose clock follows the recorded timestamps, and writes
//! every merged frame as one JSON line.

use crate::context::SimContext;
use geomerger_core::{build_merger, FusionStats, MergingConfig, SaeMessage};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot encode output frame: {0}")]
    Encode(#[from] geomerger_core::CodecError),
}

/// Summary of one replay run.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub lines_read: u64,
    pub lines_skipped: u64,
    pub frames_written: u64,
    pub stats: FusionStats,
}

/// Replays `input` through a merger built from `config`.
///
/// Lines that fail to decode are logged and skipped. The virtual clock never
/// runs backwards, so late frames are processed at the current time.
pub fn replay<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    config: MergingConfig,
    context: Arc<SimContext>,
) -> Result<ReplayReport, ReplayError> {
    let mut merger = build_merger(config, context.clone());
    let mut report = ReplayReport::default();
    let mut first_timestamp: Option<i64> = None;

    for (index, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        report.lines_read += 1;

        let msg = match SaeMessage::decode(line.as_bytes()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Skipping line {}: {}", index + 1, e);
                report.lines_skipped += 1;
                continue;
            }
        };

        let first = *first_timestamp.get_or_insert(msg.frame.timestamp_utc_ms);
        let offset_ns = clock_offset_ns(first, msg.frame.timestamp_utc_ms);
        if offset_ns > context.time_ns() {
            context.set_time(offset_ns);
        }

        for (destination, out) in merger.process(Some(msg)) {
            debug!("Frame for {} with {} detections", destination, out.detections.len());
            output.write_all(&out.encode()?)?;
            output.write_all(b"\n")?;
            report.frames_written += 1;
        }
    }

    output.flush()?;
    report.stats = merger.stats().clone();
    Ok(report)
}

/// Virtual time of a frame stamped `timestamp_ms` in a recording that starts
/// at `first_ms`. Earlier frames map to zero, huge gaps saturate.
fn clock_offset_ns(first_ms: i64, timestamp_ms: i64) -> u64 {
    let offset_ms = timestamp_ms.saturating_sub(first_ms).max(0) as u64;
    offset_ms.saturating_mul(1_000_000)
}
