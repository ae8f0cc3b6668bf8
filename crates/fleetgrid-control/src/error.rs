//! Control loop error types.

use std::time::Duration;

use fleet_core::MachineId;
use fleetgrid_autoscale::AutoscaleError;
use fleetgrid_registry::RegistryError;
use thiserror::Error;

/// Failures reported by a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("machine creation failed: {0}")]
    Create(String),

    #[error("destroying {machine} failed: {message}")]
    Destroy { machine: MachineId, message: String },

    #[error("provider `{name}` has unsupported kind `{kind}`")]
    UnsupportedKind { name: String, kind: String },

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures starting the agent software on a machine.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid deploy command: {0}")]
    InvalidCommand(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("deploy exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("deploy timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure of a single create or destroy unit.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("machine {machine_id} created but deploy failed: {source}")]
    Deploy {
        machine_id: MachineId,
        #[source]
        source: DeployError,
    },

    #[error("machine {0} has no usable address")]
    NoAddress(MachineId),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl UnitError {
    /// Machine left behind by a failed create, if one was provisioned.
    pub fn machine_id(&self) -> Option<&MachineId> {
        match self {
            UnitError::Deploy { machine_id, .. } | UnitError::NoAddress(machine_id) => {
                Some(machine_id)
            }
            UnitError::Provider(_) | UnitError::Registry(_) => None,
        }
    }
}

/// Errors that abort a whole tick.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Autoscale(#[from] AutoscaleError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cluster `{0}`: tick lease taken by another holder")]
    LeaseLost(String),
}

pub type ControlResult<T> = Result<T, ControlError>;
