//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated street:
//! - True positions of all entities (local meters around a geo origin)
//! - Physics simulation (kinematics)
//! - Camera frame generation: each camera reports what lies inside its
//!   coverage circle, under its own object ids and with position noise

use geomerger_core::geo::offset_m;
use geomerger_core::{Coordinate, Detection, GeoCoordinate, ObjectId, SaeMessage};
use nalgebra::Vector2;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A ground truth entity in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthEntity {
    /// Unique entity ID
    pub id: u64,

    /// Position [north, east] in meters from the origin
    pub position: Vector2<f64>,

    /// Velocity [north, east] in m/s
    pub velocity: Vector2<f64>,

    /// Detector class (e.g. 0 = person, 2 = car)
    pub class_id: u32,

    /// Entity is active (not removed)
    pub active: bool,
}

impl GroundTruthEntity {
    /// Creates a new entity with initial velocity.
    pub fn new(id: u64, position: Vector2<f64>, velocity: Vector2<f64>, class_id: u32) -> Self {
        Self {
            id,
            position,
            velocity,
            class_id,
            active: true,
        }
    }
}

/// A simulated camera with a circular field of view.
#[derive(Debug, Clone)]
pub struct SimCamera {
    pub source_id: String,

    /// Center of coverage [north, east] in meters
    pub center: Vector2<f64>,

    pub radius_m: f64,

    /// This camera's tracker id for every entity it has seen
    object_ids: HashMap<u64, ObjectId>,
}

impl SimCamera {
    fn covers(&self, position: &Vector2<f64>) -> bool {
        (position - self.center).norm() <= self.radius_m
    }
}

/// The Oracle - maintains ground truth and renders camera frames.
pub struct Oracle {
    /// Geo anchor of the local frame
    origin: Coordinate,

    /// RNG for measurement noise
    physics_rng: ChaCha8Rng,

    /// RNG for tracker ids (separate so noise changes don't rename objects)
    id_rng: ChaCha8Rng,

    entities: BTreeMap<u64, GroundTruthEntity>,

    cameras: Vec<SimCamera>,

    /// Next entity ID
    next_id: u64,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Position noise, `None` when noise-free
    noise: Option<Normal<f64>>,
}

impl Oracle {
    /// Creates a new Oracle anchored at `origin`.
    pub fn new(seed: u64, origin: Coordinate) -> Self {
        Self {
            origin,
            physics_rng: ChaCha8Rng::seed_from_u64(seed),
            id_rng: ChaCha8Rng::seed_from_u64(seed ^ 0x9e37_79b9_7f4a_7c15),
            entities: BTreeMap::new(),
            cameras: Vec::new(),
            next_id: 0,
            current_time: 0.0,
            noise: Normal::new(0.0, 0.1).ok(), // 10cm noise by default
        }
    }

    /// Sets the position noise standard deviation (meters).
    pub fn set_position_noise(&mut self, std_dev: f64) {
        self.noise = if std_dev > 0.0 { Normal::new(0.0, std_dev).ok() } else { None };
    }

    pub fn add_camera(&mut self, source_id: &str, center: Vector2<f64>, radius_m: f64) {
        self.cameras.push(SimCamera {
            source_id: source_id.to_string(),
            center,
            radius_m,
            object_ids: HashMap::new(),
        });
    }

    /// Spawns a new entity and returns its ID.
    pub fn spawn_entity(&mut self, position: Vector2<f64>, velocity: Vector2<f64>, class_id: u32) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entities
            .insert(id, GroundTruthEntity::new(id, position, velocity, class_id));
        id
    }

    /// Removes an entity from the simulation.
    pub fn remove_entity(&mut self, id: u64) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.active = false;
        }
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;

        // Simple constant-velocity model
        for entity in self.entities.values_mut().filter(|e| e.active) {
            entity.position += entity.velocity * dt;
        }
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// Returns all active entities.
    pub fn active_entities(&self) -> Vec<&GroundTruthEntity> {
        self.entities.values().filter(|e| e.active).collect()
    }

    /// Returns a specific entity by ID.
    pub fn entity(&self, id: u64) -> Option<&GroundTruthEntity> {
        self.entities.get(&id)
    }

    pub fn cameras(&self) -> &[SimCamera] {
        &self.cameras
    }

    /// The tracker id `source_id` assigned to entity `id`, once it was seen.
    pub fn object_id(&self, source_id: &str, id: u64) -> Option<&ObjectId> {
        self.cameras
            .iter()
            .find(|c| c.source_id == source_id)
            .and_then(|c| c.object_ids.get(&id))
    }

    /// Active entities inside at least one camera's coverage.
    pub fn visible_entities(&self) -> usize {
        self.entities
            .values()
            .filter(|e| e.active && self.cameras.iter().any(|c| c.covers(&e.position)))
            .count()
    }

    pub fn to_coordinate(&self, position: &Vector2<f64>) -> Coordinate {
        offset_m(&self.origin, position.x, position.y)
    }

    /// Renders one frame per camera, stamped `timestamp_ms`.
    ///
    /// Cameras without anything in view still emit an empty frame.
    pub fn render(&mut self, timestamp_ms: i64) -> Vec<SaeMessage> {
        let mut frames = Vec::with_capacity(self.cameras.len());
        for camera in self.cameras.iter_mut() {
            let mut detections = Vec::new();
            for entity in self.entities.values().filter(|e| e.active) {
                if !camera.covers(&entity.position) {
                    continue;
                }
                let id_rng = &mut self.id_rng;
                let object_id = camera
                    .object_ids
                    .entry(entity.id)
                    .or_insert_with(|| {
                        let uuid = uuid::Builder::from_random_bytes(id_rng.gen()).into_uuid();
                        ObjectId::new(uuid.as_bytes().to_vec())
                    })
                    .clone();

                let noise = match &self.noise {
                    Some(normal) => Vector2::new(
                        normal.sample(&mut self.physics_rng),
                        normal.sample(&mut self.physics_rng),
                    ),
                    None => Vector2::zeros(),
                };
                let measured = entity.position + noise;
                let coordinate = offset_m(&self.origin, measured.x, measured.y);

                detections.push(Detection {
                    object_id,
                    class_id: entity.class_id,
                    confidence: self.physics_rng.gen_range(0.6..0.95),
                    geo_coordinate: GeoCoordinate::from(coordinate),
                });
            }
            frames.push(SaeMessage::new(camera.source_id.clone(), timestamp_ms, detections));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geomerger_core::distance_m;
    use proptest::prelude::*;

    const CAR: u32 = 2;
    const ORIGIN: Coordinate = Coordinate::new(52.52, 13.405);

    #[test]
    fn test_oracle_physics_step() {
        let mut oracle = Oracle::new(42, ORIGIN);

        let id = oracle.spawn_entity(Vector2::new(0.0, 0.0), Vector2::new(20.0, 0.0), 2);

        oracle.step(1.0); // 1 second

        let entity = oracle.entity(id).unwrap();
        assert!((entity.position.x - 20.0).abs() < 0.001);
        assert!((oracle.time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_render_respects_coverage() {
        let mut oracle = Oracle::new(42, ORIGIN);
        oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 30.0);
        oracle.add_camera("cam2", Vector2::new(100.0, 0.0), 30.0);
        oracle.spawn_entity(Vector2::new(5.0, 0.0), Vector2::zeros(), 2);

        let frames = oracle.render(1_000);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].detections.len(), 1);
        assert!(frames[1].detections.is_empty());
        assert_eq!(frames[0].frame.timestamp_utc_ms, 1_000);
        assert_eq!(oracle.visible_entities(), 1);
    }

    #[test]
    fn test_cameras_use_their_own_stable_ids() {
        let mut oracle = Oracle::new(42, ORIGIN);
        oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 30.0);
        oracle.add_camera("cam2", Vector2::new(10.0, 0.0), 30.0);
        let id = oracle.spawn_entity(Vector2::new(5.0, 0.0), Vector2::zeros(), 2);

        let first = oracle.render(0);
        let second = oracle.render(100);

        let cam1 = oracle.object_id("cam1", id).unwrap();
        let cam2 = oracle.object_id("cam2", id).unwrap();
        assert_ne!(cam1, cam2);
        assert_eq!(&first[0].detections[0].object_id, cam1);
        assert_eq!(first[0].detections[0].object_id, second[0].detections[0].object_id);
    }

    #[test]
    fn test_noise_stays_small() {
        let mut oracle = Oracle::new(7, ORIGIN);
        oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 30.0);
        oracle.spawn_entity(Vector2::zeros(), Vector2::zeros(), 2);

        for ts in 0..50 {
            let frames = oracle.render(ts);
            let measured = Coordinate::from(frames[0].detections[0].geo_coordinate);
            assert!(distance_m(&ORIGIN, &measured) < 1.0);
        }
    }

    #[test]
    fn test_oracle_deterministic() {
        let render = || {
            let mut oracle = Oracle::new(42, ORIGIN);
            oracle.add_camera("cam1", Vector2::new(0.0, 0.0), 30.0);
            oracle.spawn_entity(Vector2::new(1.0, 2.0), Vector2::zeros(), 2);
            oracle.render(0)
        };

        // Same seed = same ids and noise
        assert_eq!(render(), render());
    }

    proptest! {
        #[test]
        fn prop_noise_free_render_matches_ground_truth(north in -25.0f64..25.0, east in -25.0f64..25.0) {
            let mut oracle = Oracle::new(3, ORIGIN);
            oracle.set_position_noise(0.0);
            oracle.add_camera("cam1", Vector2::zeros(), 40.0);
            let position = Vector2::new(north, east);
            oracle.spawn_entity(position, Vector2::zeros(), CAR);

            let frames = oracle.render(0);
            prop_assert_eq!(frames[0].detections.len(), 1);
            let measured = Coordinate::from(frames[0].detections[0].geo_coordinate);
            prop_assert!(distance_m(&oracle.to_coordinate(&position), &measured) < 1e-3);
        }
    }
}
