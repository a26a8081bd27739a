//! Key/value store with blocking queue semantics
//!
//! Every key holds an ordered queue of values. Writers either append to the
//! queue (`push`) or replace it (`put`); readers peek or take the head,
//! optionally blocking until a value shows up. This is the only durability
//! primitive the transaction coordinator relies on.
//!
//! Implementations:
//! - [`MemoryStore`]: in-process, any cloneable value type
//! - [`FjallStore`]: persistent byte store on top of Fjall
//! - [`PersistentStore`]: typed adapter over any byte store via [`Persist`]

pub mod config;
pub mod disk;
pub mod error;
pub mod memory;
pub mod persistent;
pub mod store;

pub use config::StoreConfig;
pub use disk::FjallStore;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use persistent::{Persist, PersistentStore};
pub use store::Store;
