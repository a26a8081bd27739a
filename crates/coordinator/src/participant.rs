//! Participant protocol
//!
//! A participant is one unit of business logic in the pipeline. It votes in
//! `prepare`, and if it joined the transaction it later receives exactly one
//! of `commit` or `abort`. Optional capabilities are exposed through the
//! accessor methods so the engine can check for them on a trait object.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tally_context::Context;

/// Error type participants may return from any call
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a prepare call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Ready to commit
    Prepared,
    /// Transaction must be rolled back
    Aborted,
    /// Roll back now and run the whole transaction again later
    Retry,
    /// Suspend the transaction until its context is resumed
    Pause,
}

/// A participant's vote: an action plus independent flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub action: Action,
    /// The participant did not modify the context, skip the snapshot
    pub read_only: bool,
    /// The participant does not want commit/abort callbacks
    pub no_join: bool,
}

impl Vote {
    pub const fn new(action: Action) -> Self {
        Self {
            action,
            read_only: false,
            no_join: false,
        }
    }

    pub const fn prepared() -> Self {
        Self::new(Action::Prepared)
    }

    pub const fn aborted() -> Self {
        Self::new(Action::Aborted)
    }

    pub const fn retry() -> Self {
        Self::new(Action::Retry)
    }

    pub const fn pause() -> Self {
        Self::new(Action::Pause)
    }

    /// Set the READ_ONLY flag
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set the NO_JOIN flag
    pub const fn no_join(mut self) -> Self {
        self.no_join = true;
        self
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            Action::Prepared => "PREPARED",
            Action::Aborted => "ABORTED",
            Action::Retry => "RETRY",
            Action::Pause => "PAUSE",
        };
        write!(f, "{}", action)?;
        if self.read_only {
            write!(f, "|READ_ONLY")?;
        }
        if self.no_join {
            write!(f, "|NO_JOIN")?;
        }
        Ok(())
    }
}

/// A unit of work driven through prepare/commit/abort
#[async_trait]
pub trait Participant: Send + Sync {
    /// Name used in logs and traces
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Vote on the transaction
    async fn prepare(&self, id: u64, ctx: &Context) -> Result<Vote, BoxError>;

    /// Called on members once the transaction is committed
    async fn commit(&self, _id: u64, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called on members once the transaction is aborted
    async fn abort(&self, _id: u64, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    /// Capability offered once the transaction is already aborting
    fn abort_preparer(&self) -> Option<&dyn AbortPreparer> {
        None
    }

    /// Capability used while replaying transactions after a restart
    fn recoverable(&self) -> Option<&dyn Recoverable> {
        None
    }

    /// Capability to re-route the rest of the pipeline
    fn group_selector(&self) -> Option<&dyn GroupSelector> {
        None
    }
}

/// Prepare variant invoked instead of `prepare` when an earlier participant
/// already decided to abort
#[async_trait]
pub trait AbortPreparer: Send + Sync {
    async fn prepare_for_abort(&self, id: u64, ctx: &Context) -> Result<Vote, BoxError>;
}

/// Re-acquire external resources lost across a restart before the deferred
/// commit or abort runs
#[async_trait]
pub trait Recoverable: Send + Sync {
    /// Returns the context the commit/abort call should see
    async fn recover(&self, id: u64, ctx: Context, commit: bool) -> Result<Context, BoxError>;
}

/// Picks the groups to run next
#[async_trait]
pub trait GroupSelector: Send + Sync {
    /// Space-delimited group names, or `None` to continue unchanged
    async fn select(&self, id: u64, ctx: &Context) -> Result<Option<String>, BoxError>;
}

/// Run a participant call, turning both errors and panics into a message
pub(crate) async fn guarded<T, F>(call: F) -> Result<T, String>
where
    F: Future<Output = Result<T, BoxError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
