//! Error types for the agent registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur while talking to the registry backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to open registry: {0}")]
    Open(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
