use shared::{RegistryError, TransportError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop the server from starting.
///
/// Once the tick loop runs, every per-client problem is absorbed and logged;
/// only startup can fail.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind transport: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to read registry file {path}: {source}")]
    RegistryIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse registry file: {0}")]
    RegistryFormat(#[from] serde_json::Error),

    #[error("invalid voxel registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
