//! Error types for store operations

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Corrupted entry under key {0}")]
    Corrupted(String),
}
