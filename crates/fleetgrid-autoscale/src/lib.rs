//! fleetgrid-autoscale: decides how a cluster should change this tick.
//!
//! # Pipeline
//!
//! ```text
//! Registry ──build_state──▶ ClusterState (original)
//!                              │
//!                  strategies fold left-to-right
//!                              │
//!                         bounds clamp
//!                              ▼
//!                     ClusterState (desired) + changes
//!                              │
//!                            diff
//!                              ▼
//!                         ClusterDiff
//! ```
//!
//! Every stage takes a snapshot by reference and returns a new one, so the
//! original snapshot stays intact for diffing.

pub mod diff;
pub mod error;
pub mod plan;
pub mod policy;
pub mod state;

pub use diff::diff;
pub use error::{AutoscaleError, AutoscaleResult};
pub use plan::{Plan, plan};
pub use policy::{Change, Evaluation, ScalingRule, Transition, clamp, evaluate};
pub use state::build_state;
