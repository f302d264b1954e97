use thiserror::Error;

use kipp_store::StoreError;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("upload: {0}")]
    Upload(String),
}
