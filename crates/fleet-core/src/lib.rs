//! fleet-core: shared domain model for fleetgrid.
//!
//! Holds the cluster specification (parsed once per process run from a
//! TOML cluster file), the per-tick `ClusterState` snapshot, the
//! `ClusterDiff` action plan, and the registry-facing entity types.

pub mod config;
pub mod error;
pub mod inventory;
pub mod settings;
pub mod types;

pub use config::ClusterFile;
pub use error::{ConfigError, ConfigResult};
pub use inventory::{Inventory, ProviderConfig};
pub use settings::{CeilingRule, ControlSettings, DeploySettings};
pub use types::*;
