//! Deterministic simulation harness for the geo-merger
//!
//! Every source of non-determinism the merger sees is controlled:
//! - **Time**: a virtual clock that only moves when the harness advances it
//! - **Bus**: an in-memory message bus with seeded frame loss
//! - **Randomness**: measurement noise and tracker ids derive from one seed
//!
//! The [`Oracle`] holds the ground truth street scene and renders what each
//! simulated camera reports. The [`ScenarioRunner`] feeds those frames
//! through a merger and checks the fused output against ground truth.
//!
//! # Usage
//!
//! ```ignore
//! use geomerger_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Converge);
//! assert!(result.passed);
//! ```

mod bus;
mod context;
mod oracle;
mod replay;
mod runner;
pub mod scenarios;

pub use bus::SimBus;
pub use context::SimContext;
pub use oracle::{GroundTruthEntity, Oracle, SimCamera};
pub use replay::{replay, ReplayError, ReplayReport};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
