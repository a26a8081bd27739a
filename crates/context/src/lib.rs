//! Per-transaction context
//!
//! A [`Context`] is the mutable bag of data handed to every participant of a
//! transaction. It has two views:
//! - the transient view: every entry, including opaque in-process objects
//! - the persistent view: the subset of [`Value`] entries explicitly marked
//!   persistent, which is the only part that survives a snapshot
//!
//! The context also hosts two lazily created helpers, a [`TraceLog`] and a
//! [`Profiler`], under reserved keys.

mod context;
mod error;
mod profiler;
mod trace;
mod value;

pub use context::{CONTEXT_VERSION, Context, PROFILER, TRACE_LOG};
pub use error::{ContextError, Result};
pub use profiler::{Checkpoint, Profiler};
pub use trace::{TraceEvent, TraceLog};
pub use value::Value;
