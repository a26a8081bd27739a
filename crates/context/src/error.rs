use thiserror::Error;

/// Result type for context operations
pub type Result<T> = std::result::Result<T, ContextError>;

/// Context errors
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Entry {0} holds an in-process object and cannot be persisted")]
    NotPersistable(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Unsupported context image version {0}")]
    UnsupportedVersion(u8),
}
