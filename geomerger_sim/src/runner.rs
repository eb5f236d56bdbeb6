//! Scenario runner - executes chaos engineering test scenarios.
//!
//! Every scenario builds a small street scene in the [`Oracle`], renders one
//! frame per camera and tick, feeds the frames through a merger running on
//! the virtual clock of a [`SimContext`], and finally checks the merger's
//! output and identity state against ground truth.

use crate::context::SimContext;
use crate::oracle::Oracle;
use crate::scenarios::ScenarioId;

use geomerger_core::{
    Coordinate, IdentityKey, Merger, MergingConfig, SaeMessage, Strategy, WindowedMerger, WorldModelMerger,
};
use nalgebra::Vector2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Geo anchor of every simulated scene.
const ORIGIN: Coordinate = Coordinate::new(48.7758, 9.1829);

/// Class id of simulated cars.
const CAR: u32 = 2;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of active entities at end
    pub final_entity_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Camera frames rendered
    pub frames_rendered: u64,

    /// Frames lost before reaching the merger
    pub frames_dropped: u64,

    /// Merged frames emitted
    pub frames_out: u64,

    /// Map/remap transitions applied
    pub mappings_changed: u64,

    /// Invalid transitions or rejected forest mutations
    pub anomalies: u64,

    /// Largest cluster seen (world model only)
    pub max_cluster_size: usize,

    /// Detections in the last merged frame
    pub final_output_size: usize,

    /// Keys in the identity forest at the end
    pub final_identities: usize,
}

/// Runs chaos scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Camera frame rate in Hz
    tick_rate_hz: u32,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Base merging parameters; scenarios set streams and strategy
    config: MergingConfig,
}

/// Scene, clock and loss model shared by all scenarios.
struct Harness {
    context: Arc<SimContext>,
    oracle: Oracle,
    tick: Duration,
    ticks: u64,

    /// Frame loss `(rng, rate)`, `None` for a lossless feed
    loss: Option<(ChaCha8Rng, f64)>,

    metrics: ScenarioMetrics,
    last_output: Option<SaeMessage>,
}

impl Harness {
    fn step<M: Merger>(&mut self, merger: &mut M) {
        self.oracle.step(self.tick.as_secs_f64());
        self.context.advance_time(self.tick);
        self.ticks += 1;

        let frames = self.oracle.render(self.context.epoch_ms());
        let mut delivered = 0;
        for frame in frames {
            self.metrics.frames_rendered += 1;
            if let Some((rng, rate)) = self.loss.as_mut() {
                if rng.gen_bool(*rate) {
                    self.metrics.frames_dropped += 1;
                    continue;
                }
            }
            delivered += 1;
            let outputs = merger.process(Some(frame));
            self.collect(outputs);
        }

        // Keep virtual time moving on silent ticks
        if delivered == 0 {
            let outputs = merger.process(None);
            self.collect(outputs);
        }
    }

    fn run<M: Merger>(&mut self, merger: &mut M, ticks: u64) {
        for tick in 0..ticks {
            self.step(merger);
            if tick % 10 == 0 {
                debug!(
                    "  t={:.1}s | entities={} | frames_out={}",
                    self.oracle.time(),
                    self.oracle.active_entities().len(),
                    self.metrics.frames_out
                );
            }
        }
    }

    fn collect(&mut self, outputs: Vec<(String, SaeMessage)>) {
        for (_, msg) in outputs {
            self.metrics.frames_out += 1;
            self.last_output = Some(msg);
        }
    }

    fn output_size(&self) -> usize {
        self.last_output.as_ref().map_or(0, |m| m.detections.len())
    }

    fn finish<M: Merger>(mut self, scenario: ScenarioId, seed: u64, merger: &M, identities: usize, failures: Vec<String>) -> ScenarioResult {
        let stats = merger.stats();
        self.metrics.mappings_changed = stats.mappings_changed;
        self.metrics.anomalies = stats.anomalies;
        self.metrics.max_cluster_size = stats.max_cluster_size;
        self.metrics.final_output_size = self.output_size();
        self.metrics.final_identities = identities;

        let passed = failures.is_empty();
        if passed {
            info!(
                "✓ {} complete: {} frames in, {} out, {} mappings",
                scenario.name(),
                self.metrics.frames_rendered - self.metrics.frames_dropped,
                self.metrics.frames_out,
                self.metrics.mappings_changed
            );
        } else {
            warn!("✗ {} failed: {}", scenario.name(), failures.join("; "));
        }

        ScenarioResult {
            scenario,
            seed,
            passed,
            total_ticks: self.ticks,
            final_time_secs: self.oracle.time(),
            final_entity_count: self.oracle.active_entities().len(),
            failure_reason: (!passed).then(|| failures.join("; ")),
            metrics: self.metrics,
        }
    }
}

/// Spawns `count` cars in a column along north, 8 m apart, centered on
/// `center`, all driving with `velocity`.
fn spawn_column(oracle: &mut Oracle, count: usize, center: Vector2<f64>, velocity: Vector2<f64>) -> Vec<u64> {
    let spacing = 8.0;
    let offset = (count as f64 - 1.0) * spacing / 2.0;
    (0..count)
        .map(|i| {
            let position = center + Vector2::new(i as f64 * spacing - offset, 0.0);
            oracle.spawn_entity(position, velocity, CAR)
        })
        .collect()
}

fn expect(failures: &mut Vec<String>, ok: bool, reason: impl FnOnce() -> String) {
    if !ok {
        failures.push(reason());
    }
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 10,
            max_duration_secs: 10.0,
            config: MergingConfig::default(),
        }
    }

    /// Sets the camera frame rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the base merging parameters.
    pub fn with_config(mut self, config: MergingConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        match scenario {
            ScenarioId::Converge => self.run_converge(ScenarioId::Converge, 0.0),
            ScenarioId::Disjoint => self.run_disjoint(),
            ScenarioId::TripleOverlap => self.run_triple_overlap(),
            ScenarioId::Expiry => self.run_expiry(),
            ScenarioId::Windowed => self.run_windowed(),
            ScenarioId::Lossy => self.run_converge(ScenarioId::Lossy, 0.3),
        }
    }

    fn harness(&self, loss_rate: f64) -> Harness {
        let context = SimContext::shared(self.seed);
        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let loss = (loss_rate > 0.0).then(|| (context.derive_rng(1), loss_rate));
        Harness {
            oracle: Oracle::new(physics_seed, ORIGIN),
            context,
            tick: Duration::from_millis(1000 / u64::from(self.tick_rate_hz)),
            ticks: 0,
            loss,
            metrics: ScenarioMetrics::default(),
            last_output: None,
        }
    }

    fn merging_config(&self, strategy: Strategy, cameras: &[&str]) -> MergingConfig {
        MergingConfig {
            strategy,
            input_stream_ids: cameras.iter().map(|c| c.to_string()).collect(),
            ..self.config.clone()
        }
    }

    fn target_ticks(&self) -> u64 {
        (self.max_duration_secs * self.tick_rate_hz as f64) as u64
    }

    /// DST-001 / DST-006: Two overlapping cameras see the same cars.
    ///
    /// **Assertion**: the last merged frame holds exactly one detection per
    /// car, and every car ended up as a single primary.
    fn run_converge(&self, scenario: ScenarioId, loss_rate: f64) -> ScenarioResult {
        info!("{}: two overlapping cameras, {:.0}% frame loss", scenario.name(), loss_rate * 100.0);

        let mut h = self.harness(loss_rate);
        h.oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 200.0);
        h.oracle.add_camera("cam2", Vector2::new(10.0, 0.0), 200.0);
        let cars = spawn_column(&mut h.oracle, 4, Vector2::new(0.0, -10.0), Vector2::new(0.0, 1.0));

        let config = self.merging_config(Strategy::WorldModel, &["cam1", "cam2"]);
        let mut merger = WorldModelMerger::new(config, h.context.clone());
        h.run(&mut merger, self.target_ticks());

        let forest = merger.forest().inner();
        let mut failures = Vec::new();
        expect(&mut failures, h.output_size() == cars.len(), || {
            format!("last frame has {} detections, expected {}", h.output_size(), cars.len())
        });
        expect(&mut failures, forest.primaries().len() == cars.len(), || {
            format!("{} primaries for {} cars", forest.primaries().len(), cars.len())
        });
        expect(&mut failures, forest.is_consistent(), || "identity forest inconsistent".to_string());
        expect(&mut failures, merger.stats().anomalies == 0, || {
            format!("{} anomalies", merger.stats().anomalies)
        });
        if loss_rate > 0.0 {
            expect(&mut failures, h.metrics.frames_dropped > 0, || "no frames were lost".to_string());
        }

        let identities = forest.len();
        h.finish(scenario, self.seed, &merger, identities, failures)
    }

    /// DST-002: Cameras 500 m apart.
    ///
    /// **Assertion**: no mapping is ever created; all cars stay separate.
    fn run_disjoint(&self) -> ScenarioResult {
        info!("DST-002: Disjoint - cameras without overlap");

        let mut h = self.harness(0.0);
        h.oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 30.0);
        h.oracle.add_camera("cam2", Vector2::new(500.0, 0.0), 30.0);
        let mut cars = spawn_column(&mut h.oracle, 3, Vector2::new(0.0, 0.0), Vector2::zeros());
        cars.extend(spawn_column(&mut h.oracle, 3, Vector2::new(500.0, 0.0), Vector2::zeros()));

        let config = self.merging_config(Strategy::WorldModel, &["cam1", "cam2"]);
        let mut merger = WorldModelMerger::new(config, h.context.clone());
        h.run(&mut merger, self.target_ticks());

        let mut failures = Vec::new();
        expect(&mut failures, merger.stats().mappings_changed == 0, || {
            format!("{} mappings between disjoint cameras", merger.stats().mappings_changed)
        });
        expect(&mut failures, merger.forest().inner().is_empty(), || "identity forest not empty".to_string());
        expect(&mut failures, h.output_size() == cars.len(), || {
            format!("last frame has {} detections, expected {}", h.output_size(), cars.len())
        });

        h.finish(ScenarioId::Disjoint, self.seed, &merger, 0, failures)
    }

    /// DST-003: Three cameras over one crossing.
    ///
    /// **Assertion**: 3-member clusters appear, they are applied pair-wise
    /// without breaking the forest, and the output holds one record per car.
    fn run_triple_overlap(&self) -> ScenarioResult {
        info!("DST-003: TripleOverlap - three cameras, one crossing");

        let mut h = self.harness(0.0);
        h.oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 200.0);
        h.oracle.add_camera("cam2", Vector2::new(10.0, 0.0), 200.0);
        h.oracle.add_camera("cam3", Vector2::new(0.0, 10.0), 200.0);
        let cars = spawn_column(&mut h.oracle, 3, Vector2::new(0.0, -5.0), Vector2::new(0.0, 1.0));

        let config = self.merging_config(Strategy::WorldModel, &["cam1", "cam2", "cam3"]);
        let mut merger = WorldModelMerger::new(config, h.context.clone());
        h.run(&mut merger, self.target_ticks());

        let forest = merger.forest().inner();
        let mut failures = Vec::new();
        expect(&mut failures, merger.stats().max_cluster_size >= 3, || {
            format!("largest cluster has {} members", merger.stats().max_cluster_size)
        });
        expect(&mut failures, forest.is_consistent(), || "identity forest inconsistent".to_string());
        expect(&mut failures, h.output_size() == cars.len(), || {
            format!("last frame has {} detections, expected {}", h.output_size(), cars.len())
        });

        let identities = forest.len();
        h.finish(ScenarioId::TripleOverlap, self.seed, &merger, identities, failures)
    }

    /// DST-004: A car leaves, another one later appears at the same spot.
    ///
    /// Runs fixed phases: 3 s with the first car, 14 s empty (tracks expire,
    /// then their identities), 2 s with the second car.
    ///
    /// **Assertion**: the first car's identities are gone from the forest
    /// and the world model, and the second car is not emitted under them.
    fn run_expiry(&self) -> ScenarioResult {
        info!("DST-004: Expiry - identities outlive nothing");

        let mut h = self.harness(0.0);
        h.oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 200.0);
        h.oracle.add_camera("cam2", Vector2::new(10.0, 0.0), 200.0);

        let config = self.merging_config(Strategy::WorldModel, &["cam1", "cam2"]);
        let mut merger = WorldModelMerger::new(config, h.context.clone());
        let hz = u64::from(self.tick_rate_hz);

        let first = h.oracle.spawn_entity(Vector2::zeros(), Vector2::new(0.0, 1.0), CAR);
        h.run(&mut merger, 3 * hz);
        let old_keys: Vec<IdentityKey> = ["cam1", "cam2"]
            .iter()
            .filter_map(|cam| {
                h.oracle
                    .object_id(cam, first)
                    .map(|id| IdentityKey::new(*cam, id.as_bytes().to_vec()))
            })
            .collect();
        let merged_before = merger.forest().inner().len();

        h.oracle.remove_entity(first);
        h.run(&mut merger, 14 * hz);

        let second = h.oracle.spawn_entity(Vector2::zeros(), Vector2::new(0.0, 1.0), CAR);
        h.run(&mut merger, 2 * hz);

        let forest = merger.forest().inner();
        let mut failures = Vec::new();
        expect(&mut failures, old_keys.len() == 2 && merged_before == 2, || {
            format!("first car was not merged ({} keys, forest size {})", old_keys.len(), merged_before)
        });
        for key in &old_keys {
            expect(&mut failures, !forest.is_known(key), || format!("{} still known", key));
            let tracked = merger
                .world()
                .source(&key.source_id)
                .is_some_and(|s| s.get(&key.object_id).is_some());
            expect(&mut failures, !tracked, || format!("{} still tracked", key));
        }

        let new_ids: Vec<_> = ["cam1", "cam2"]
            .iter()
            .filter_map(|cam| h.oracle.object_id(cam, second).cloned())
            .collect();
        let emitted_new = h.last_output.as_ref().is_some_and(|out| {
            out.detections.len() == 1 && new_ids.contains(&out.detections[0].object_id)
        });
        expect(&mut failures, emitted_new, || {
            "second car not emitted under its own identity".to_string()
        });

        let identities = forest.len();
        h.finish(ScenarioId::Expiry, self.seed, &merger, identities, failures)
    }

    /// DST-005: Overlapping cameras through the windowed merger.
    ///
    /// **Assertion**: merged slices are emitted and the last one holds one
    /// detection per car.
    fn run_windowed(&self) -> ScenarioResult {
        info!("DST-005: Windowed - sliding window merger");

        let mut h = self.harness(0.0);
        h.oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 200.0);
        h.oracle.add_camera("cam2", Vector2::new(10.0, 0.0), 200.0);
        let cars = spawn_column(&mut h.oracle, 3, Vector2::new(0.0, -10.0), Vector2::new(0.0, 1.0));

        let config = self.merging_config(Strategy::Windowed, &["cam1", "cam2"]);
        let mut merger = WindowedMerger::new(config, h.context.clone());
        h.run(&mut merger, self.target_ticks());

        let forest = merger.forest().inner();
        let mut failures = Vec::new();
        expect(&mut failures, h.metrics.frames_out > 0, || "no merged slices".to_string());
        expect(&mut failures, h.output_size() == cars.len(), || {
            format!("last slice has {} detections, expected {}", h.output_size(), cars.len())
        });
        expect(&mut failures, forest.is_consistent(), || "identity forest inconsistent".to_string());
        expect(&mut failures, merger.stats().anomalies == 0, || {
            format!("{} anomalies", merger.stats().anomalies)
        });

        let identities = forest.len();
        h.finish(ScenarioId::Windowed, self.seed, &merger, identities, failures)
    }
}
