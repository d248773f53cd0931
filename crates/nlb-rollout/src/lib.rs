//! Blue/green traffic shifting between two versions of a protocol's
//! module pool.
//!
//! Each protocol carries at most one [`DeploymentState`]. Weights always
//! sum to 100 and every change is pushed into the router so endpoints of
//! each version carry the current split.
//!
//! ```text
//!  init ──▶ Active ──start_canary──▶ Transitioning ──promote (final)──▶ Active
//!             ▲                          │   ▲
//!             │                          └───┘ promote
//!             └── instant_switch ──┐
//!                                  │
//!            rollback (any state) ─┴─▶ RolledBack
//! ```
//!
//! Canary promotion is caller-driven; nothing advances on a timer.

pub mod affinity;
pub mod controller;
pub mod deployment;
pub mod error;

pub use affinity::AffinityKey;
pub use controller::BlueGreenController;
pub use deployment::{DeploymentMode, DeploymentState, DeploymentStatus, WeightChange};
pub use error::{RolloutError, RolloutResult};
