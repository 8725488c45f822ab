use shared::TransportError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid server address `{0}`")]
    InvalidAddress(String),

    #[error("failed to read skin {path}: {source}")]
    Skin {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("skin of {0} bytes exceeds the upload limit")]
    SkinTooLarge(usize),

    #[error("server is full")]
    Rejected,

    #[error("no reply from server within {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection to server lost")]
    Disconnected,
}
