//! Geo Merger Core - Multi-Camera Object Fusion by Geographic Proximity
//!
//! This library solves three problems of fusing detections from cameras with
//! overlapping fields of view:
//! 1. **Many Names Problem**: one object, one id per camera, via a flat
//!    primary/secondary identity forest with expiration
//! 2. **Lookahead Problem**: out-of-order multi-source input, via a
//!    time-sorted window that only releases slices with enough data behind them
//! 3. **Sparse Samples Problem**: objects seen at different instants, via
//!    per-source tracks that extrapolate to a common query time

pub mod buffer;
pub mod config;
pub mod expiring;
pub mod fusion;
pub mod geo;
pub mod identity;
pub mod merger;
pub mod message;
pub mod stage_runtime;
pub mod world_model;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use buffer::{MessageBuffer, Timestamped};
pub use config::{BusConfig, ConfigError, MergingConfig, StageConfig, Strategy};
pub use expiring::ExpiringForest;
pub use fusion::{FusionError, FusionStats, Merger, Transition};
pub use geo::{distance_m, Coordinate};
pub use identity::{IdentityError, IdentityForest, IdentityKey, ObjectId, Role};
pub use merger::{build_merger, WindowedMerger, WorldModelMerger};
pub use message::{CodecError, Detection, Frame, GeoCoordinate, SaeMessage};
pub use stage_runtime::{MergerStage, StageOptions, StageReport};
pub use world_model::{Cluster, SourceBatch, WorldModel};
