//! fleetgrid-control: turns a plan into machines.
//!
//! One call to [`ClusterControl::tick`] is one reconciliation cycle:
//!
//! ```text
//! ClusterControl::tick
//!   ├── Registry lease (one tick per cluster at a time)
//!   ├── fleetgrid-autoscale::plan (state → strategies → clamp → diff)
//!   ├── Reconciler
//!   │     ├── to_create × (Provider::create_machine → Deployer → Registry)
//!   │     └── to_delete × (Registry stop/unregister → Provider::destroy_machine)
//!   └── Orphan sweep (provider machines unknown to the registry)
//! ```
//!
//! Units run concurrently up to `ControlSettings::max_concurrency`, each
//! unit's steps strictly in order. Every provider and deployer call is
//! bounded by `ControlSettings::call_timeout_secs`. A failed unit is
//! reported and left for the next tick; nothing is rolled back.

pub mod control;
pub mod deploy;
pub mod error;
pub mod provider;
pub mod reconciler;
pub mod report;

#[cfg(test)]
mod testing;

pub use control::ClusterControl;
pub use deploy::{CommandDeployer, DeployOutcome, DeployRequest, Deployer};
pub use error::{ControlError, ControlResult, DeployError, ProviderError, UnitError};
pub use provider::{LocalProvider, MachineHandle, MachineRequest, Provider, provider_for};
pub use reconciler::Reconciler;
pub use report::{TickReport, UnitOutcome};
