//! Autoscaler error types.

use fleetgrid_registry::RegistryError;
use thiserror::Error;

/// Errors that abort a tick before any action is taken.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("registry unavailable while building state for cluster `{cluster}`: {source}")]
    RegistryUnavailable {
        cluster: String,
        #[source]
        source: RegistryError,
    },

    #[error("strategy `{strategy}` watches queue `{queue}` which is missing from the snapshot")]
    MissingQueue { strategy: String, queue: String },
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
