//! Chaos engineering scenarios for the merger.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// DST-001: Two overlapping cameras, every object ends up with one id
    Converge,

    /// DST-002: Cameras far apart, nothing may ever merge
    Disjoint,

    /// DST-003: Three cameras over one crossing, 3-member clusters
    TripleOverlap,

    /// DST-004: Objects leave, identities and tracks are purged
    Expiry,

    /// DST-005: Overlapping cameras through the windowed merger
    Windowed,

    /// DST-006: Overlapping cameras with 30% of frames lost
    Lossy,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Converge,
            ScenarioId::Disjoint,
            ScenarioId::TripleOverlap,
            ScenarioId::Expiry,
            ScenarioId::Windowed,
            ScenarioId::Lossy,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Converge => "converge",
            ScenarioId::Disjoint => "disjoint",
            ScenarioId::TripleOverlap => "triple_overlap",
            ScenarioId::Expiry => "expiry",
            ScenarioId::Windowed => "windowed",
            ScenarioId::Lossy => "lossy",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Converge => "2 overlapping cameras, 4 moving cars, verify one id per car",
            ScenarioId::Disjoint => "2 cameras 500m apart, verify no mappings",
            ScenarioId::TripleOverlap => "3 cameras over one crossing, verify 3-member clusters and a consistent forest",
            ScenarioId::Expiry => "car leaves coverage, verify its ids expire and are not inherited",
            ScenarioId::Windowed => "2 overlapping cameras through the sliding-window merger",
            ScenarioId::Lossy => "2 overlapping cameras, 30% frame loss on the bus",
        }
    }

    /// Returns true if this scenario runs the windowed strategy.
    pub fn is_windowed(&self) -> bool {
        matches!(self, ScenarioId::Windowed)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "converge" | "dst-001" => Ok(ScenarioId::Converge),
            "disjoint" | "dst-002" => Ok(ScenarioId::Disjoint),
            "triple_overlap" | "tripleoverlap" | "triple" | "dst-003" => Ok(ScenarioId::TripleOverlap),
            "expiry" | "dst-004" => Ok(ScenarioId::Expiry),
            "windowed" | "dst-005" => Ok(ScenarioId::Windowed),
            "lossy" | "dst-006" => Ok(ScenarioId::Lossy),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
