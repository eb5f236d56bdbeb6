//! Geo Merger Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the merging
//! engines to run in both **Production** (tokio) and **Simulation**
//! (manually advanced clock) environments.
//!
//! # Core Concept
//!
//! The engines never read the system clock or touch a socket directly:
//! - Time (`now()`, `system_time()`, `sleep()`) comes from a [`MergerContext`]
//! - Stream I/O (`recv()`, `publish()`) goes through a [`MessageBus`]
//!
//! Swapping both for simulated implementations makes every expiration
//! sweep and every extrapolated position reproducible.
//!
//! # Example
//!
//! ```ignore
//! use geomerger_env::{MergerContext, MessageBus};
//!
//! async fn pump<Ctx: MergerContext, Bus: MessageBus>(ctx: &Ctx, bus: &Bus) {
//!     while let Some((key, payload)) = bus.recv(Duration::from_millis(500)).await? {
//!         handle(ctx.now(), key, payload);
//!     }
//! }
//! ```

mod bus;
mod context;
mod error;
mod tokio_impl;
mod types;

pub use bus::MessageBus;
pub use context::MergerContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use types::{BusRecord, StreamKey};
