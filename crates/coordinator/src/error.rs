//! Error types for the coordinator

use tally_context::ContextError;
use tally_store::StoreError;
use thiserror::Error;

/// Coordinator error types
///
/// Participant failures, loop detection and recovery inconsistencies are not
/// errors here: the engine absorbs them and records them in the transaction
/// trace.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Coordinator is not running")]
    NotRunning,

    #[error("Coordinator is already running")]
    AlreadyRunning,

    #[error("Context is already being processed by another session")]
    InProgress,
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
