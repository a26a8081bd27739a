//! Durable transaction log
//!
//! All keys live in the coordinator's namespace (`<name>:`):
//! - `STATE.<id>`: [`TxnState`] of a transaction that has not been purged
//! - `CONTEXT.<id>`: latest snapshot of the context's persistent view
//! - `GROUPS.<id>`: queue of group names selected while preparing
//! - `HEAD`: next id to allocate
//! - `TAIL`: oldest id that may still be unresolved
//! - `HEAD_LOCK`, `TAIL_LOCK`: mutual-exclusion tokens
//!
//! Every id below `TAIL` is resolved and purged. The counters are guarded by
//! tokens kept in the store itself, so several coordinators sharing one store
//! exclude each other.

use crate::error::{CoordinatorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tally_context::Context;
use tally_store::Store;

/// First id ever allocated
pub const FIRST_ID: u64 = 1;

const LOCK_TOKEN: &[u8] = b"LOCK";

/// Durable phase of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Preparing,
    Committing,
    Done,
}

impl TxnState {
    pub(crate) fn to_bytes(self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&self, &mut bytes).map_err(|e| {
            CoordinatorError::Serialization(format!("Failed to serialize state: {}", e))
        })?;
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| {
            CoordinatorError::Serialization(format!("Failed to deserialize state: {}", e))
        })
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Preparing => write!(f, "PREPARING"),
            TxnState::Committing => write!(f, "COMMITTING"),
            TxnState::Done => write!(f, "DONE"),
        }
    }
}

/// Transaction log of one coordinator over a byte store
#[derive(Clone)]
pub struct TxnLog {
    store: Arc<dyn Store<Vec<u8>>>,
    name: String,
}

/// Holds a lock token; returns it to the store on drop
pub(crate) struct LockGuard {
    store: Arc<dyn Store<Vec<u8>>>,
    key: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.push(&self.key, LOCK_TOKEN.to_vec()) {
            tracing::error!("Failed to release {}: {}", self.key, e);
        }
    }
}

impl TxnLog {
    pub fn new(store: Arc<dyn Store<Vec<u8>>>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.name, suffix)
    }

    fn state_key(&self, id: u64) -> String {
        self.key(&format!("STATE.{}", id))
    }

    fn context_key(&self, id: u64) -> String {
        self.key(&format!("CONTEXT.{}", id))
    }

    fn groups_key(&self, id: u64) -> String {
        self.key(&format!("GROUPS.{}", id))
    }

    /// Put a token under each lock key that has none.
    ///
    /// A token missing at startup was lost with a process that died holding
    /// it.
    pub fn seed_locks(&self) -> Result<()> {
        for lock in ["HEAD_LOCK", "TAIL_LOCK"] {
            let key = self.key(lock);
            if self.store.read_if_present(&key)?.is_none() {
                tracing::debug!("Seeding lock token {}", key);
                self.store.push(&key, LOCK_TOKEN.to_vec())?;
            }
        }
        Ok(())
    }

    async fn lock(&self, lock: &str) -> Result<LockGuard> {
        let key = self.key(lock);
        self.store.take(&key, None).await?;
        Ok(LockGuard {
            store: self.store.clone(),
            key,
        })
    }

    pub(crate) async fn lock_tail(&self) -> Result<LockGuard> {
        self.lock("TAIL_LOCK").await
    }

    fn counter(&self, name: &str) -> Result<u64> {
        match self.store.read_if_present(&self.key(name))? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    CoordinatorError::Serialization(format!(
                        "{} holds {} bytes, expected 8",
                        name,
                        bytes.len()
                    ))
                })?;
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(FIRST_ID),
        }
    }

    fn set_counter(&self, name: &str, value: u64) -> Result<()> {
        self.store.put(&self.key(name), value.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Next id to be allocated
    pub fn head(&self) -> Result<u64> {
        self.counter("HEAD")
    }

    /// Oldest id that may still be unresolved
    pub fn tail(&self) -> Result<u64> {
        self.counter("TAIL")
    }

    pub(crate) fn set_tail(&self, tail: u64) -> Result<()> {
        self.set_counter("TAIL", tail)
    }

    /// Allocate a transaction id
    pub async fn next_id(&self) -> Result<u64> {
        self.next_id_with(|_| {}).await
    }

    /// Allocate a transaction id, calling `allocated` before the HEAD lock is
    /// released
    pub(crate) async fn next_id_with(&self, allocated: impl FnOnce(u64)) -> Result<u64> {
        let _guard = self.lock("HEAD_LOCK").await?;
        let id = self.head()?;
        self.set_counter("HEAD", id + 1)?;
        allocated(id);
        Ok(id)
    }

    /// Read the head under the HEAD lock, so no allocation is half done
    pub(crate) async fn with_head<T>(&self, read: impl FnOnce(u64) -> T) -> Result<T> {
        let _guard = self.lock("HEAD_LOCK").await?;
        Ok(read(self.head()?))
    }

    pub fn state(&self, id: u64) -> Result<Option<TxnState>> {
        self.store
            .read_if_present(&self.state_key(id))?
            .map(|bytes| TxnState::from_bytes(&bytes))
            .transpose()
    }

    pub fn set_state(&self, id: u64, state: TxnState) -> Result<()> {
        self.store.put(&self.state_key(id), state.to_bytes()?)?;
        Ok(())
    }

    /// Overwrite the stored snapshot with the context's persistent view
    pub fn snapshot(&self, id: u64, ctx: &Context) -> Result<()> {
        self.store.put(&self.context_key(id), ctx.to_bytes()?)?;
        Ok(())
    }

    /// Latest snapshot of `id`
    pub fn context(&self, id: u64) -> Result<Option<Context>> {
        match self.store.read_if_present(&self.context_key(id))? {
            Some(bytes) => Ok(Some(Context::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn push_group(&self, id: u64, group: &str) -> Result<()> {
        self.store
            .push(&self.groups_key(id), group.as_bytes().to_vec())?;
        Ok(())
    }

    /// Groups selected for `id`, in selection order
    pub fn groups(&self, id: u64) -> Result<Vec<String>> {
        self.store
            .read_all(&self.groups_key(id))?
            .into_iter()
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|e| {
                    CoordinatorError::Serialization(format!("Invalid group name: {}", e))
                })
            })
            .collect()
    }

    /// Drop every entry of `id`
    pub fn purge(&self, id: u64) -> Result<()> {
        self.store.remove(&self.state_key(id))?;
        self.store.remove(&self.context_key(id))?;
        self.store.remove(&self.groups_key(id))?;
        Ok(())
    }

    /// Whether any entry of `id` is still present
    pub fn contains(&self, id: u64) -> Result<bool> {
        Ok(self.store.read_if_present(&self.state_key(id))?.is_some()
            || self.store.read_if_present(&self.context_key(id))?.is_some()
            || self.store.read_if_present(&self.groups_key(id))?.is_some())
    }

    /// Purge finished transactions from the tail and move the tail past them.
    ///
    /// Stops at the first id that is not DONE. Returns the new tail.
    pub async fn advance_tail(&self) -> Result<u64> {
        let _guard = self.lock_tail().await?;
        let head = self.head()?;
        let start = self.tail()?;

        let mut tail = start;
        while tail < head && self.state(tail)? == Some(TxnState::Done) {
            self.purge(tail)?;
            tail += 1;
        }

        if tail != start {
            self.set_tail(tail)?;
            tracing::debug!("{} tail advanced {} -> {}", self.name, start, tail);
        }
        Ok(tail)
    }
}
