//! Durable transaction coordinator
//!
//! Drives units of work through a pipeline of participants using
//! prepare/commit/abort:
//! - every participant votes in `prepare`; members (participants that did
//!   not vote NO_JOIN) later receive exactly one of `commit` or `abort`
//! - group selectors splice named groups into the pipeline at run time
//! - a PAUSE vote suspends the transaction until its context is resumed
//! - a RETRY vote rolls back and parks the context in a retry queue that a
//!   background task drains back onto the input queue
//!
//! Transaction state and context snapshots go to a durable log so that
//! transactions interrupted by a crash are committed or aborted on the next
//! start. Finished transactions are purged from the tail of the log.

mod config;
mod coordinator;
mod error;
mod log;
mod participant;
mod paused;
mod pipeline;
mod recovery;
mod registry;
mod stores;

pub use config::{CoordinatorConfig, ParticipantConfig, PipelineConfig};
pub use coordinator::{Coordinator, Disposition};
pub use error::{CoordinatorError, Result};
pub use log::{FIRST_ID, TxnLog, TxnState};
pub use participant::{Action, AbortPreparer, BoxError, GroupSelector, Participant, Recoverable, Vote};
pub use paused::{PAUSED_TRANSACTION, PausedTransaction};
pub use pipeline::{DEFAULT_GROUP, Pipeline};
pub use recovery::RecoveryReport;
pub use registry::ParticipantRegistry;
pub use stores::Stores;

pub use tally_context::{Context, Value};
