//! Error types for entile-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Unreadable source, malformed pipeline, or a bounds/config violation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient endpoint failure; callers retry with backoff
    #[error("Endpoint I/O error: {0}")]
    EndpointIo(String),

    /// Resource not found on the endpoint
    #[error("Not found: {0}")]
    NotFound(String),

    /// A chunk failed magic/size verification; aborts the build
    #[error("Corrupt chunk: {0}")]
    ChunkCorrupt(String),

    /// Two shards claim the same chunk key during a merge
    #[error("Merge collision: {0}")]
    MergeCollision(String),

    /// User-initiated cancellation
    #[error("Build cancelled")]
    Cancelled,

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a transient endpoint I/O error
    pub fn endpoint_io(msg: impl Into<String>) -> Self {
        Error::EndpointIo(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a corrupt chunk error
    pub fn chunk_corrupt(msg: impl Into<String>) -> Self {
        Error::ChunkCorrupt(msg.into())
    }

    /// Create a merge collision error
    pub fn merge_collision(msg: impl Into<String>) -> Self {
        Error::MergeCollision(msg.into())
    }

    /// True for failures worth retrying at the endpoint layer
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::EndpointIo(_))
    }
}
