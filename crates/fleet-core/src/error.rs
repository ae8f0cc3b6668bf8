//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading a cluster file.
///
/// File-level variants (`Io`, `Syntax`) fail the whole load. The remaining
/// variants are recorded against a single cluster and leave the others
/// loadable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cluster file: {0}")]
    Syntax(String),

    #[error("cluster `{cluster}`: {message}")]
    InvalidCluster { cluster: String, message: String },

    #[error("cluster `{cluster}`: unknown strategy `{name}`")]
    UnknownStrategy { cluster: String, name: String },

    #[error("cluster `{cluster}`: strategy `{strategy}` watches queue `{queue}` which is not in queue_names")]
    UnknownQueue {
        cluster: String,
        strategy: String,
        queue: String,
    },

    #[error("cluster `{cluster}`: provider `{provider}` is not declared in the inventory")]
    UnknownProvider { cluster: String, provider: String },

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),
}
