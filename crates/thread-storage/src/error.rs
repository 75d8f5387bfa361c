use thread_core::{ContractError, StreamStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("validation failed: {0}")]
    Validation(#[from] ContractError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stream {id} is {from}; cannot move to {to}")]
    InvalidTransition {
        id: String,
        from: StreamStatus,
        to: StreamStatus,
    },
    #[error("edge {from} -> {to} would close a dependency cycle")]
    CycleDetected { from: String, to: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("id generation failed: {0}")]
    IdGeneration(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
