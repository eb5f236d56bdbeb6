//! The two merger strategies.
//!
//! - [`WorldModelMerger`] tracks every object per source, clusters the
//!   extrapolated positions and emits the canonical state at a fixed rate.
//! - [`WindowedMerger`] keeps the raw frames of all sources in a sliding
//!   window, matches detections inside it and emits merged slices once
//!   enough lookahead has arrived.
//!
//! Both share the identity forest, the transition table and aggregation.

use crate::buffer::MessageBuffer;
use crate::config::{MergingConfig, Strategy};
use crate::expiring::ExpiringForest;
use crate::fusion::{aggregate, apply_match, FusionError, FusionStats, Merger, Transition};
use crate::geo::{distance_m, Coordinate};
use crate::identity::IdentityKey;
use crate::message::{Detection, GeoCoordinate, SaeMessage};
use crate::world_model::{Cluster, TimestampMs, WorldModel};
use geomerger_env::MergerContext;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds the merger selected by `config.strategy`.
pub fn build_merger<Ctx: MergerContext>(config: MergingConfig, context: Arc<Ctx>) -> Box<dyn Merger + Send> {
    match config.strategy {
        Strategy::WorldModel => Box::new(WorldModelMerger::new(config, context)),
        Strategy::Windowed => Box::new(WindowedMerger::new(config, context)),
    }
}

fn record_match(
    stats: &mut FusionStats,
    reference: &IdentityKey,
    candidate: &IdentityKey,
    result: Result<Transition, FusionError>,
) {
    match &result {
        Ok(Transition::Map { secondary, primary }) => info!("Mapped {} to {}", secondary, primary),
        Ok(Transition::Remap { secondary, new_primary }) => debug!("Remapped {} to {}", secondary, new_primary),
        Ok(Transition::Keep) => {}
        Err(e) => warn!("Skipping match {} ~ {}: {}", reference, candidate, e),
    }
    stats.record_transition(&result);
}

// ============================================================================
// WORLD MODEL MERGER
// ============================================================================

/// Emits the fused, extrapolated world state at most `target_mps` times per
/// second of model time.
pub struct WorldModelMerger<Ctx: MergerContext> {
    config: MergingConfig,
    world: WorldModel<Ctx>,
    forest: ExpiringForest<Ctx>,
    stats: FusionStats,

    /// Model time of the last emission
    last_emission_ms: Option<TimestampMs>,
}

impl<Ctx: MergerContext> WorldModelMerger<Ctx> {
    pub fn new(config: MergingConfig, context: Arc<Ctx>) -> Self {
        let world = WorldModel::new(context.clone(), config.max_distance_m, config.class_gating);
        let forest = ExpiringForest::new(context, config.expiration_age(), config.sweep_interval());
        Self {
            config,
            world,
            forest,
            stats: FusionStats::default(),
            last_emission_ms: None,
        }
    }

    pub fn world(&self) -> &WorldModel<Ctx> {
        &self.world
    }

    pub fn forest(&self) -> &ExpiringForest<Ctx> {
        &self.forest
    }

    fn apply_cluster(&mut self, cluster: &Cluster) {
        self.stats.max_cluster_size = self.stats.max_cluster_size.max(cluster.size());
        if cluster.size() > 2 {
            self.stats.multi_source_clusters += 1;
            info!(
                "{}-source cluster around {}, matching pair-wise",
                cluster.size(),
                cluster.reference().key()
            );
        }

        let reference = cluster.reference().key();
        for candidate in cluster.matches() {
            let candidate = candidate.key();
            let result = apply_match(&mut self.forest, &reference, &candidate);
            record_match(&mut self.stats, &reference, &candidate, result);
        }
    }

    fn emit(&mut self, at_ms: TimestampMs) -> SaeMessage {
        let snapshot = self.world.snapshot(at_ms);
        let records: Vec<(IdentityKey, Detection)> = snapshot
            .into_iter()
            .map(|(source_id, object)| {
                let key = IdentityKey {
                    source_id,
                    object_id: object.object_id.clone(),
                };
                let canonical = self.forest.canonical(&key);
                let detection = Detection {
                    object_id: object.object_id,
                    class_id: object.class_id,
                    confidence: object.confidence,
                    geo_coordinate: GeoCoordinate::from(object.observation.coord),
                };
                (canonical, detection)
            })
            .collect();

        SaeMessage::new(self.config.output_stream_id.clone(), at_ms, aggregate(records))
    }
}

impl<Ctx: MergerContext> Merger for WorldModelMerger<Ctx> {
    fn process(&mut self, msg: Option<SaeMessage>) -> Vec<(String, SaeMessage)> {
        if let Some(msg) = msg {
            self.stats.record_input(&msg);
            self.world.observe(&msg.to_source_batch());
        }

        let expired = self.world.expire(self.config.expiration_age());
        if !expired.is_empty() {
            debug!("Expired {} tracks", expired.len());
        }
        self.forest.maintain();

        let Some(now_ms) = self.world.current_time() else {
            return Vec::new();
        };

        for cluster in self.world.find_clusters(now_ms) {
            self.apply_cluster(&cluster);
        }

        if let Some(last) = self.last_emission_ms {
            if now_ms - last < self.config.min_slice_ms() {
                return Vec::new();
            }
        }
        self.last_emission_ms = Some(now_ms);

        let out = self.emit(now_ms);
        self.stats.record_output(&out);
        vec![(self.config.output_stream_id.clone(), out)]
    }

    fn stats(&self) -> &FusionStats {
        &self.stats
    }
}

// ============================================================================
// WINDOWED MERGER
// ============================================================================

/// Matches raw detections inside a sliding window and emits merged slices.
pub struct WindowedMerger<Ctx: MergerContext> {
    config: MergingConfig,
    buffer: MessageBuffer<SaeMessage>,
    forest: ExpiringForest<Ctx>,
    stats: FusionStats,
}

impl<Ctx: MergerContext> WindowedMerger<Ctx> {
    pub fn new(config: MergingConfig, context: Arc<Ctx>) -> Self {
        let buffer = MessageBuffer::new(config.merging_window_ms);
        let forest = ExpiringForest::new(context, config.expiration_age(), config.sweep_interval());
        Self {
            config,
            buffer,
            forest,
            stats: FusionStats::default(),
        }
    }

    pub fn buffer(&self) -> &MessageBuffer<SaeMessage> {
        &self.buffer
    }

    pub fn forest(&self) -> &ExpiringForest<Ctx> {
        &self.forest
    }

    fn update_mappings(&mut self) {
        let mut matches = Vec::new();
        for msg in self.buffer.iter() {
            for detection in &msg.detections {
                if let Some(candidate) = find_match(&self.buffer, msg, detection, &self.config) {
                    matches.push((msg.key_of(detection), candidate));
                }
            }
        }

        for (reference, candidate) in matches {
            let result = apply_match(&mut self.forest, &reference, &candidate);
            record_match(&mut self.stats, &reference, &candidate, result);
        }
    }

    /// Rewrites `slice` to canonical identities and folds it into one frame
    /// stamped with the earliest timestamp.
    fn merge(&mut self, slice: Vec<SaeMessage>) -> SaeMessage {
        let earliest = slice
            .iter()
            .map(|m| m.frame.timestamp_utc_ms)
            .min()
            .unwrap_or_default();

        let mut records = Vec::new();
        for msg in slice {
            let source_id = msg.frame.source_id;
            for detection in msg.detections {
                let key = IdentityKey {
                    source_id: source_id.clone(),
                    object_id: detection.object_id.clone(),
                };
                records.push((self.forest.canonical(&key), detection));
            }
        }

        SaeMessage::new(self.config.output_stream_id.clone(), earliest, aggregate(records))
    }
}

/// Nearest detection of another source in the window, within the merge
/// threshold. Equal distances prefer the frame closest in time.
fn find_match(
    buffer: &MessageBuffer<SaeMessage>,
    msg: &SaeMessage,
    detection: &Detection,
    config: &MergingConfig,
) -> Option<IdentityKey> {
    let origin = Coordinate::from(detection.geo_coordinate);
    let mut best: Option<(f64, i64, IdentityKey)> = None;

    for other in buffer.iter() {
        if other.frame.source_id == msg.frame.source_id {
            continue;
        }
        let dt = (other.frame.timestamp_utc_ms - msg.frame.timestamp_utc_ms).abs();
        for candidate in &other.detections {
            if config.class_gating && candidate.class_id != detection.class_id {
                continue;
            }
            let distance = distance_m(&origin, &Coordinate::from(candidate.geo_coordinate));
            if distance >= config.max_distance_m {
                continue;
            }
            let closer = match &best {
                None => true,
                Some((best_distance, best_dt, _)) => (distance, dt) < (*best_distance, *best_dt),
            };
            if closer {
                best = Some((distance, dt, other.key_of(candidate)));
            }
        }
    }
    best.map(|(_, _, key)| key)
}

impl<Ctx: MergerContext> Merger for WindowedMerger<Ctx> {
    fn process(&mut self, msg: Option<SaeMessage>) -> Vec<(String, SaeMessage)> {
        if let Some(msg) = msg {
            self.stats.record_input(&msg);
            self.buffer.append(msg);
        }

        self.forest.maintain();

        if self.buffer.is_healthy() {
            self.update_mappings();
        }

        let slice = self.buffer.pop_slice(self.config.min_slice_ms());
        if slice.is_empty() {
            return Vec::new();
        }

        let out = self.merge(slice);
        self.stats.record_output(&out);
        vec![(self.config.output_stream_id.clone(), out)]
    }

    fn stats(&self) -> &FusionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset_m;
    use crate::identity::ObjectId;
    use crate::testing::ManualClock;
    use approx::assert_relative_eq;

    const ORIGIN: Coordinate = Coordinate::new(48.1374, 11.5755);

    fn detection(id: &[u8], north_m: f64) -> Detection {
        Detection {
            object_id: ObjectId::new(id),
            class_id: 2,
            confidence: 0.9,
            geo_coordinate: offset_m(&ORIGIN, north_m, 0.0).into(),
        }
    }

    fn detection_with(id: &[u8], north_m: f64, confidence: f32) -> Detection {
        Detection {
            confidence,
            ..detection(id, north_m)
        }
    }

    fn assert_midpoint(detection: &Detection) {
        let midpoint = offset_m(&ORIGIN, 0.25, 0.0);
        assert_relative_eq!(detection.geo_coordinate.latitude, midpoint.lat, epsilon = 1e-9);
        assert_relative_eq!(detection.geo_coordinate.longitude, midpoint.lon, epsilon = 1e-9);
        assert_relative_eq!(detection.confidence, 0.7, epsilon = 1e-6);
    }

    fn config(strategy: Strategy) -> MergingConfig {
        MergingConfig {
            strategy,
            input_stream_ids: vec!["cam1".to_string(), "cam2".to_string()],
            ..MergingConfig::default()
        }
    }

    #[test]
    fn test_world_model_no_output_before_first_input() {
        let clock = ManualClock::shared();
        let mut merger = WorldModelMerger::new(config(Strategy::WorldModel), clock.clone());

        clock.advance_ms(500);
        assert!(merger.process(None).is_empty());
    }

    #[test]
    fn test_world_model_merges_overlapping_cameras() {
        let clock = ManualClock::shared();
        let mut merger = WorldModelMerger::new(config(Strategy::WorldModel), clock.clone());

        // First emission is immediate
        let out = merger.process(Some(SaeMessage::new("cam1", 1_000, vec![detection(b"a", 0.0)])));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "merged");
        assert_eq!(out[0].1.detections.len(), 1);

        // Throttled, but the match is recorded
        let out = merger.process(Some(SaeMessage::new("cam2", 1_000, vec![detection(b"b", 0.5)])));
        assert!(out.is_empty());
        assert_eq!(merger.stats().mappings_changed, 1);

        clock.advance_ms(100);
        let out = merger.process(None);

        assert_eq!(out.len(), 1);
        let frame = &out[0].1;
        assert_eq!(frame.frame.timestamp_utc_ms, 1_100);
        assert_eq!(frame.frame.source_id, "merged");
        assert_eq!(frame.detections.len(), 1);
        assert_eq!(frame.detections[0].object_id, ObjectId::new(b"a".to_vec()));
        assert_eq!(merger.stats().frames_out, 2);
    }

    #[test]
    fn test_world_model_keeps_distant_objects_apart() {
        let clock = ManualClock::shared();
        let mut merger = WorldModelMerger::new(config(Strategy::WorldModel), clock.clone());

        merger.process(Some(SaeMessage::new("cam1", 0, vec![detection(b"a", 0.0)])));
        merger.process(Some(SaeMessage::new("cam2", 0, vec![detection(b"b", 30.0)])));
        clock.advance_ms(200);
        let out = merger.process(None);

        assert_eq!(out[0].1.detections.len(), 2);
        assert_eq!(merger.stats().mappings_changed, 0);
        assert!(merger.forest().inner().is_empty());
    }

    #[test]
    fn test_world_model_expires_tracks() {
        let clock = ManualClock::shared();
        let mut merger = WorldModelMerger::new(config(Strategy::WorldModel), clock.clone());

        merger.process(Some(SaeMessage::new("cam1", 0, vec![detection(b"a", 0.0)])));
        merger.process(Some(SaeMessage::new("cam2", 0, vec![detection(b"b", 0.5)])));
        assert_eq!(merger.world().track_count(), 2);

        clock.advance_ms(6_000);
        let out = merger.process(None);

        assert_eq!(merger.world().track_count(), 0);
        assert!(out[0].1.detections.is_empty());
    }

    #[test]
    fn test_windowed_merges_overlapping_cameras() {
        let clock = ManualClock::shared();
        let mut merger = WindowedMerger::new(config(Strategy::Windowed), clock.clone());

        let mut outputs = Vec::new();
        for ts in (0..=1_500).step_by(100) {
            outputs.extend(merger.process(Some(SaeMessage::new("cam1", ts, vec![detection(b"a", 0.0)]))));
            outputs.extend(merger.process(Some(SaeMessage::new("cam2", ts, vec![detection(b"b", 0.5)]))));
            clock.advance_ms(100);
        }

        assert!(!outputs.is_empty());
        assert_eq!(outputs[0].1.frame.timestamp_utc_ms, 0);
        for (destination, frame) in &outputs {
            assert_eq!(destination, "merged");
            assert_eq!(frame.detections.len(), 1);
            assert_eq!(frame.detections[0].object_id, ObjectId::new(b"a".to_vec()));
        }
        assert_eq!(merger.stats().anomalies, 0);
        assert!(merger.forest().inner().is_consistent());
    }

    #[test]
    fn test_world_model_emits_mean_of_merged_detections() {
        let clock = ManualClock::shared();
        let mut merger = WorldModelMerger::new(config(Strategy::WorldModel), clock.clone());

        merger.process(Some(SaeMessage::new("cam1", 1_000, vec![detection_with(b"a", 0.0, 0.6)])));
        merger.process(Some(SaeMessage::new("cam2", 1_000, vec![detection_with(b"b", 0.5, 0.8)])));
        clock.advance_ms(100);
        let out = merger.process(None);

        let frame = &out[0].1;
        assert_eq!(frame.detections.len(), 1);
        assert_eq!(frame.detections[0].object_id, ObjectId::new(b"a".to_vec()));
        assert_midpoint(&frame.detections[0]);
    }

    #[test]
    fn test_windowed_emits_mean_of_merged_detections() {
        let clock = ManualClock::shared();
        let mut merger = WindowedMerger::new(config(Strategy::Windowed), clock.clone());

        let mut outputs = Vec::new();
        for ts in (0..=1_500).step_by(100) {
            outputs.extend(merger.process(Some(SaeMessage::new("cam1", ts, vec![detection_with(b"a", 0.0, 0.6)]))));
            outputs.extend(merger.process(Some(SaeMessage::new("cam2", ts, vec![detection_with(b"b", 0.5, 0.8)]))));
            clock.advance_ms(100);
        }

        assert!(!outputs.is_empty());
        for (_, frame) in &outputs {
            assert_eq!(frame.detections.len(), 1);
            assert_midpoint(&frame.detections[0]);
        }
    }

    #[test]
    fn test_windowed_holds_back_until_window_spans() {
        let clock = ManualClock::shared();
        let mut merger = WindowedMerger::new(config(Strategy::Windowed), clock);

        for ts in (0..=900).step_by(100) {
            assert!(merger
                .process(Some(SaeMessage::new("cam1", ts, vec![detection(b"a", 0.0)])))
                .is_empty());
        }
        assert_eq!(merger.buffer().len(), 10);
    }

    #[test]
    fn test_find_match_prefers_nearest() {
        let config = config(Strategy::Windowed);
        let mut buffer = MessageBuffer::new(1000);
        let reference = SaeMessage::new("cam1", 0, vec![detection(b"a", 0.0)]);
        buffer.append(reference.clone());
        buffer.append(SaeMessage::new("cam2", 0, vec![detection(b"far", 1.5), detection(b"near", 0.2)]));
        buffer.append(SaeMessage::new("cam3", 0, vec![detection(b"out", 5.0)]));

        let found = find_match(&buffer, &reference, &reference.detections[0], &config);

        assert_eq!(found, Some(IdentityKey::new("cam2", b"near".to_vec())));
    }

    #[test]
    fn test_build_merger_selects_strategy() {
        let clock = ManualClock::shared();
        let mut merger = build_merger(config(Strategy::Windowed), clock);

        // A windowed merger holds a single frame back
        assert!(merger
            .process(Some(SaeMessage::new("cam1", 0, vec![detection(b"a", 0.0)])))
            .is_empty());
        assert_eq!(merger.stats().frames_in, 1);
    }
}
