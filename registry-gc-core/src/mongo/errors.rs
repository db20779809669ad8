use thiserror::Error;

#[derive(Debug, Error)]
pub enum MongoUsageError {
    #[error("transient MongoDB transport error: {0}")]
    Transport(#[from] mongodb::error::Error),

    #[error("failed to deserialize MongoDB document: {0}")]
    Deserialize(String),

    #[error("schema validation error in collection {collection}: {message}")]
    Schema { collection: String, message: String },

    #[error("no usage snapshot found at {path} or any timestamped variant")]
    SnapshotNotFound { path: String },

    #[error("failed to persist usage snapshot to {path}: {source}")]
    SnapshotWrite { path: String, source: std::io::Error },
}

impl MongoUsageError {
    /// Transient transport errors are retryable; schema/validation
    /// failures are fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MongoUsageError::Transport(_))
    }
}
