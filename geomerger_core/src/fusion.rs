//! The "FUSION" Orchestrator - turns matched pairs into identity mappings
//!
//! Each match is a `(reference, candidate)` pair of identities from two
//! different sources that were found to be the same physical object. The
//! current roles of both keys select one forest mutation:
//!
//! | reference     | candidate     | action                          |
//! |---------------|---------------|---------------------------------|
//! | Unknown       | Unknown       | map candidate → reference       |
//! | Primary       | Unknown       | map candidate → reference       |
//! | Unknown       | Primary       | map reference → candidate       |
//! | Secondary     | Unknown       | remap reference → candidate     |
//! | Unknown       | Secondary     | remap candidate → reference     |
//! | Primary       | Secondary     | remap candidate → reference     |
//! | Secondary     | Primary       | remap reference → candidate     |
//!
//! The last two are no-ops if the secondary already belongs to the other
//! key. Every other combination is an [`FusionError::InvalidTransition`].
//!
//! Output records are rewritten to their canonical identity; records that
//! collapse onto the same identity are averaged.

use crate::expiring::ExpiringForest;
use crate::geo::Coordinate;
use crate::identity::{IdentityError, IdentityKey, Role};
use crate::message::{Detection, SaeMessage};
use geomerger_env::MergerContext;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FusionError {
    #[error("No transition for {reference} ({reference_role}) matched with {candidate} ({candidate_role})")]
    InvalidTransition {
        reference: IdentityKey,
        candidate: IdentityKey,
        reference_role: Role,
        candidate_role: Role,
    },

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// The forest mutation selected for one matched pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Map {
        secondary: IdentityKey,
        primary: IdentityKey,
    },
    Remap {
        secondary: IdentityKey,
        new_primary: IdentityKey,
    },
    /// Mapping already in place
    Keep,
}

/// Selects the mutation for `(reference, candidate)` given their roles.
pub fn plan_transition(
    reference: &IdentityKey,
    reference_role: &Role,
    candidate: &IdentityKey,
    candidate_role: &Role,
) -> Result<Transition, FusionError> {
    let map = |secondary: &IdentityKey, primary: &IdentityKey| Transition::Map {
        secondary: secondary.clone(),
        primary: primary.clone(),
    };
    let remap = |secondary: &IdentityKey, new_primary: &IdentityKey| Transition::Remap {
        secondary: secondary.clone(),
        new_primary: new_primary.clone(),
    };

    let transition = match (reference_role, candidate_role) {
        (Role::Unknown, Role::Unknown) | (Role::Primary, Role::Unknown) => map(candidate, reference),
        (Role::Unknown, Role::Primary) => map(reference, candidate),
        (Role::SecondaryOf(_), Role::Unknown) => remap(reference, candidate),
        (Role::Unknown, Role::SecondaryOf(_)) => remap(candidate, reference),
        (Role::Primary, Role::SecondaryOf(owner)) => {
            if owner == reference {
                Transition::Keep
            } else {
                remap(candidate, reference)
            }
        }
        (Role::SecondaryOf(owner), Role::Primary) => {
            if owner == candidate {
                Transition::Keep
            } else {
                remap(reference, candidate)
            }
        }
        _ => {
            return Err(FusionError::InvalidTransition {
                reference: reference.clone(),
                candidate: candidate.clone(),
                reference_role: reference_role.clone(),
                candidate_role: candidate_role.clone(),
            })
        }
    };
    Ok(transition)
}

/// Looks up both roles, then plans and applies the transition for a match.
pub fn apply_match<Ctx: MergerContext>(
    forest: &mut ExpiringForest<Ctx>,
    reference: &IdentityKey,
    candidate: &IdentityKey,
) -> Result<Transition, FusionError> {
    let reference_role = forest.role(reference);
    let candidate_role = forest.role(candidate);
    let transition = plan_transition(reference, &reference_role, candidate, &candidate_role)?;

    match &transition {
        Transition::Map { secondary, primary } => forest.map_secondary(secondary, primary)?,
        Transition::Remap { secondary, new_primary } => forest.remap_secondary(secondary, new_primary)?,
        Transition::Keep => {}
    }
    Ok(transition)
}

// ============================================================================
// MERGER
// ============================================================================

/// Counters kept by every merger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    pub frames_in: u64,
    pub detections_in: u64,
    pub frames_out: u64,
    pub detections_out: u64,

    /// Map/remap transitions applied
    pub mappings_changed: u64,

    /// Invalid transitions and rejected forest mutations
    pub anomalies: u64,

    /// Clusters with more than two members
    pub multi_source_clusters: u64,

    pub max_cluster_size: usize,
}

impl FusionStats {
    pub fn record_input(&mut self, msg: &SaeMessage) {
        self.frames_in += 1;
        self.detections_in += msg.detections.len() as u64;
    }

    pub fn record_output(&mut self, msg: &SaeMessage) {
        self.frames_out += 1;
        self.detections_out += msg.detections.len() as u64;
    }

    pub fn record_transition(&mut self, transition: &Result<Transition, FusionError>) {
        match transition {
            Ok(Transition::Keep) => {}
            Ok(_) => self.mappings_changed += 1,
            Err(_) => self.anomalies += 1,
        }
    }
}

/// One fusion stage: consumes decoded input frames, yields
/// `(destination, frame)` pairs.
pub trait Merger {
    /// Processes one input frame, or just advances time when `None`.
    fn process(&mut self, msg: Option<SaeMessage>) -> Vec<(String, SaeMessage)>;

    fn stats(&self) -> &FusionStats;
}

impl<M: Merger + ?Sized> Merger for Box<M> {
    fn process(&mut self, msg: Option<SaeMessage>) -> Vec<(String, SaeMessage)> {
        (**self).process(msg)
    }

    fn stats(&self) -> &FusionStats {
        (**self).stats()
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

struct Accumulator {
    key: IdentityKey,
    class_id: u32,
    lat: f64,
    lon: f64,
    confidence: f64,
    count: usize,
}

/// Collapses records sharing a canonical identity into their mean.
///
/// Latitude, longitude and confidence are averaged; the class is taken from
/// the first record. Groups come out in first-seen order.
pub fn aggregate<I>(records: I) -> Vec<Detection>
where
    I: IntoIterator<Item = (IdentityKey, Detection)>,
{
    let mut index: HashMap<IdentityKey, usize> = HashMap::new();
    let mut groups: Vec<Accumulator> = Vec::new();

    for (canonical, detection) in records {
        let coord = Coordinate::from(detection.geo_coordinate);
        match index.get(&canonical) {
            Some(&i) => {
                let group = &mut groups[i];
                group.lat += coord.lat;
                group.lon += coord.lon;
                group.confidence += f64::from(detection.confidence);
                group.count += 1;
            }
            None => {
                index.insert(canonical.clone(), groups.len());
                groups.push(Accumulator {
                    key: canonical,
                    class_id: detection.class_id,
                    lat: coord.lat,
                    lon: coord.lon,
                    confidence: f64::from(detection.confidence),
                    count: 1,
                });
            }
        }
    }

    groups
        .into_iter()
        .map(|g| {
            let n = g.count as f64;
            Detection {
                object_id: g.key.object_id,
                class_id: g.class_id,
                confidence: (g.confidence / n) as f32,
                geo_coordinate: Coordinate::new(g.lat / n, g.lon / n).into(),
            }
        })
        .collect()
}
