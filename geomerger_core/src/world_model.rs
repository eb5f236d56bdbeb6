//! The "WORLD" Model - per-camera position tracking and cross-camera clustering
//!
//! Every camera gets a [`SourceTrackStore`] holding one [`PositionTrack`]
//! per object it reports. Tracks keep the two most recent observations and
//! extrapolate linearly, so objects seen by different cameras at slightly
//! different instants can be compared at a common query time.
//!
//! Clustering asks, for every tracked object, which object of every *other*
//! camera is closest (and within the merge threshold) at that time.

use crate::geo::{distance_m, Coordinate};
use crate::identity::{IdentityKey, ObjectId};
use geomerger_env::MergerContext;
use nalgebra::Vector2;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Milliseconds since epoch, in message time.
pub type TimestampMs = i64;

// ============================================================================
// OBSERVATIONS
// ============================================================================

/// A position at a point in message time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub timestamp_ms: TimestampMs,
    pub coord: Coordinate,
}

/// One detected object as reported by a single source.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedObject {
    pub object_id: ObjectId,
    pub class_id: u32,
    pub confidence: f32,
    pub observation: Observation,
}

/// One source's detections at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub source_id: String,
    pub timestamp_ms: TimestampMs,
    pub objects: Vec<ObservedObject>,
}

// ============================================================================
// POSITION TRACK
// ============================================================================

/// Position model of one object seen from one source.
#[derive(Debug, Clone)]
pub struct PositionTrack {
    object_id: ObjectId,

    /// Attributes of the most recent detection
    class_id: u32,
    confidence: f32,

    /// The two most recent observations, oldest first
    positions: VecDeque<Observation>,

    /// Context time of the last `observe`
    last_update: Duration,
}

impl PositionTrack {
    const HISTORY: usize = 2;

    pub fn new(object_id: ObjectId, class_id: u32, confidence: f32, now: Duration) -> Self {
        Self {
            object_id,
            class_id,
            confidence,
            positions: VecDeque::with_capacity(Self::HISTORY),
            last_update: now,
        }
    }

    pub fn observe(&mut self, coord: Coordinate, timestamp_ms: TimestampMs, now: Duration) {
        if self.positions.len() == Self::HISTORY {
            self.positions.pop_front();
        }
        self.positions.push_back(Observation { timestamp_ms, coord });
        self.last_update = now;
    }

    /// Velocity in degrees per second between the two stored observations.
    ///
    /// Zero if there are fewer than two, or if both share a timestamp.
    pub fn velocity(&self) -> Vector2<f64> {
        match (self.positions.front(), self.positions.back()) {
            (Some(prev), Some(last)) if last.timestamp_ms != prev.timestamp_ms => {
                let dt = (last.timestamp_ms - prev.timestamp_ms) as f64 / 1000.0;
                (last.coord.to_vector() - prev.coord.to_vector()) / dt
            }
            _ => Vector2::zeros(),
        }
    }

    /// Linear inter-/extrapolation from the newest observation to `at_ms`.
    ///
    /// A single observation is returned unchanged for any query time.
    pub fn position(&self, at_ms: TimestampMs) -> Option<Coordinate> {
        let last = self.positions.back()?;
        if self.positions.len() < Self::HISTORY {
            return Some(last.coord);
        }
        let dt = (at_ms - last.timestamp_ms) as f64 / 1000.0;
        Some(Coordinate::from_vector(last.coord.to_vector() + self.velocity() * dt))
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn last_update(&self) -> Duration {
        self.last_update
    }

    /// The track as an observed object at `at_ms`.
    pub fn object_at(&self, at_ms: TimestampMs) -> Option<ObservedObject> {
        let coord = self.position(at_ms)?;
        Some(ObservedObject {
            object_id: self.object_id.clone(),
            class_id: self.class_id,
            confidence: self.confidence,
            observation: Observation {
                timestamp_ms: at_ms,
                coord,
            },
        })
    }
}

// ============================================================================
// SOURCE TRACK STORE
// ============================================================================

/// All tracks reported by one source.
#[derive(Debug, Clone)]
pub struct SourceTrackStore {
    source_id: String,
    tracks: BTreeMap<ObjectId, PositionTrack>,
}

impl SourceTrackStore {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            tracks: BTreeMap::new(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn observe_object(&mut self, object: &ObservedObject, now: Duration) {
        let track = self
            .tracks
            .entry(object.object_id.clone())
            .or_insert_with(|| PositionTrack::new(object.object_id.clone(), object.class_id, object.confidence, now));
        track.class_id = object.class_id;
        track.confidence = object.confidence;
        track.observe(object.observation.coord, object.observation.timestamp_ms, now);
    }

    /// Closest track to `reference` at `at_ms`, with its position and distance.
    ///
    /// With `class_id` set, only tracks of that class are considered.
    pub fn find_closest(
        &self,
        reference: &Coordinate,
        class_id: Option<u32>,
        at_ms: TimestampMs,
    ) -> Option<(&PositionTrack, Coordinate, f64)> {
        self.tracks
            .values()
            .filter(|track| class_id.map_or(true, |class| track.class_id == class))
            .filter_map(|track| {
                let coord = track.position(at_ms)?;
                Some((track, coord, distance_m(reference, &coord)))
            })
            .min_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Deletes tracks not updated for longer than `max_age`.
    pub fn expire(&mut self, max_age: Duration, now: Duration) -> Vec<ObjectId> {
        let expired: Vec<ObjectId> = self
            .tracks
            .iter()
            .filter(|(_, track)| now.saturating_sub(track.last_update) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.tracks.remove(id);
        }
        expired
    }

    /// Every track's extrapolated state at `at_ms`.
    pub fn snapshot(&self, at_ms: TimestampMs) -> Vec<ObservedObject> {
        self.tracks.values().filter_map(|t| t.object_at(at_ms)).collect()
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<&PositionTrack> {
        self.tracks.get(object_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &PositionTrack> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

// ============================================================================
// CLUSTERS
// ============================================================================

/// One member of a candidate cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCandidate {
    pub source_id: String,

    /// Object with its position at query time
    pub object: ObservedObject,

    /// Distance to the cluster's reference object (0 for the reference)
    pub distance_m: f64,
}

impl ClusterCandidate {
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            source_id: self.source_id.clone(),
            object_id: self.object.object_id.clone(),
        }
    }
}

/// A reference object plus its nearest in-threshold match in every other
/// source that had one.
///
/// Only [`WorldModel::find_clusters`] builds clusters, so `reference()` and
/// `matches()` always have something to return.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    members: Vec<ClusterCandidate>,
}

impl Cluster {
    /// `None` for fewer than two members.
    fn from_members(members: Vec<ClusterCandidate>) -> Option<Self> {
        (members.len() >= 2).then_some(Self { members })
    }

    pub fn members(&self) -> &[ClusterCandidate] {
        &self.members
    }

    pub fn reference(&self) -> &ClusterCandidate {
        &self.members[0]
    }

    pub fn matches(&self) -> &[ClusterCandidate] {
        &self.members[1..]
    }

    /// Number of sources in the cluster, at least two.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Member identities as an order-independent set.
    pub fn identity_set(&self) -> BTreeSet<IdentityKey> {
        self.members.iter().map(ClusterCandidate::key).collect()
    }
}

// ============================================================================
// WORLD MODEL
// ============================================================================

/// All sources' track stores plus the model clock.
pub struct WorldModel<Ctx: MergerContext> {
    context: Arc<Ctx>,

    sources: BTreeMap<String, SourceTrackStore>,

    /// Model time at the last `observe`
    clock_anchor_ms: Option<TimestampMs>,

    /// Context time of the last `observe`
    last_observe: Duration,

    /// Merge threshold
    max_distance_m: f64,

    /// Only match objects of equal class
    class_gating: bool,
}

impl<Ctx: MergerContext> WorldModel<Ctx> {
    pub fn new(context: Arc<Ctx>, max_distance_m: f64, class_gating: bool) -> Self {
        let last_observe = context.now();
        Self {
            context,
            sources: BTreeMap::new(),
            clock_anchor_ms: None,
            last_observe,
            max_distance_m,
            class_gating,
        }
    }

    /// Routes every object of `batch` to its source's store.
    pub fn observe(&mut self, batch: &SourceBatch) {
        let now = self.context.now();
        let store = self
            .sources
            .entry(batch.source_id.clone())
            .or_insert_with(|| SourceTrackStore::new(batch.source_id.clone()));
        for object in &batch.objects {
            store.observe_object(object, now);
        }

        // Re-anchor without ever stepping behind the time already reported
        self.clock_anchor_ms = Some(match self.current_time() {
            Some(current) => current.max(batch.timestamp_ms),
            None => batch.timestamp_ms,
        });
        self.last_observe = now;
    }

    /// Model time at the last `observe` plus the context time elapsed since.
    /// Never decreases; `None` before the first observation.
    pub fn current_time(&self) -> Option<TimestampMs> {
        let latest = self.clock_anchor_ms?;
        let elapsed = self.context.now().saturating_sub(self.last_observe);
        Some(latest + elapsed.as_millis() as TimestampMs)
    }

    /// Candidate clusters at `at_ms`, each identity set reported once.
    pub fn find_clusters(&self, at_ms: TimestampMs) -> Vec<Cluster> {
        let mut seen: HashSet<BTreeSet<IdentityKey>> = HashSet::new();
        let mut clusters = Vec::new();

        for (source_id, store) in &self.sources {
            for track in store.tracks() {
                let Some(reference) = track.object_at(at_ms) else {
                    continue;
                };
                let class = self.class_gating.then_some(track.class_id);
                let coord = reference.observation.coord;

                let mut members = vec![ClusterCandidate {
                    source_id: source_id.clone(),
                    object: reference,
                    distance_m: 0.0,
                }];
                for (other_id, other) in &self.sources {
                    if other_id == source_id {
                        continue;
                    }
                    let Some((closest, position, distance)) = other.find_closest(&coord, class, at_ms) else {
                        continue;
                    };
                    if distance < self.max_distance_m {
                        if let Some(mut object) = closest.object_at(at_ms) {
                            object.observation.coord = position;
                            members.push(ClusterCandidate {
                                source_id: other_id.clone(),
                                object,
                                distance_m: distance,
                            });
                        }
                    }
                }

                let Some(cluster) = Cluster::from_members(members) else {
                    continue;
                };
                if seen.insert(cluster.identity_set()) {
                    clusters.push(cluster);
                }
            }
        }
        clusters
    }

    /// Every live object with its source, extrapolated to `at_ms`.
    pub fn snapshot(&self, at_ms: TimestampMs) -> Vec<(String, ObservedObject)> {
        self.sources
            .iter()
            .flat_map(|(source_id, store)| {
                store
                    .snapshot(at_ms)
                    .into_iter()
                    .map(move |object| (source_id.clone(), object))
            })
            .collect()
    }

    /// Deletes tracks not updated for longer than `max_age`, and stores
    /// left empty. Returns the expired identities.
    pub fn expire(&mut self, max_age: Duration) -> Vec<IdentityKey> {
        let now = self.context.now();
        let mut expired = Vec::new();
        for (source_id, store) in self.sources.iter_mut() {
            expired.extend(store.expire(max_age, now).into_iter().map(|object_id| IdentityKey {
                source_id: source_id.clone(),
                object_id,
            }));
        }
        self.sources.retain(|_, store| !store.is_empty());
        expired
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceTrackStore> {
        self.sources.get(source_id)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn track_count(&self) -> usize {
        self.sources.values().map(SourceTrackStore::len).sum()
    }
}

// ============================================================================
// TESTS
// ============================================================================
