//! Stores the coordinator runs on

use crate::config::CoordinatorConfig;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;
use tally_context::Context;
use tally_store::{FjallStore, MemoryStore, PersistentStore, Store};

/// The three stores a coordinator consumes
///
/// The input queue carries live contexts, objects included, so it is always
/// an in-process store. The log holds transaction state and snapshots; the
/// retry queue only needs the persistent view of each context and may share
/// the log's backend.
#[derive(Clone)]
pub struct Stores {
    pub input: Arc<dyn Store<Context>>,
    pub retry: Arc<dyn Store<Context>>,
    pub log: Arc<dyn Store<Vec<u8>>>,
}

impl Stores {
    pub fn new(
        input: Arc<dyn Store<Context>>,
        retry: Arc<dyn Store<Context>>,
        log: Arc<dyn Store<Vec<u8>>>,
    ) -> Self {
        Self { input, retry, log }
    }

    /// Everything in memory; nothing survives a restart
    pub fn in_memory() -> Self {
        Self {
            input: Arc::new(MemoryStore::<Context>::new()),
            retry: Arc::new(MemoryStore::<Context>::new()),
            log: Arc::new(MemoryStore::<Vec<u8>>::new()),
        }
    }

    /// Log and retry queue in a Fjall store under `path`
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let log: Arc<dyn Store<Vec<u8>>> = Arc::new(FjallStore::open(path)?);
        Ok(Self::with_log(log))
    }

    /// In-memory input queue, `log` for both the log and the retry queue
    pub fn with_log(log: Arc<dyn Store<Vec<u8>>>) -> Self {
        Self {
            input: Arc::new(MemoryStore::<Context>::new()),
            retry: Arc::new(PersistentStore::<Context>::new(log.clone())),
            log,
        }
    }

    /// Persistent when `data_dir` is configured, in memory otherwise
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self> {
        match &config.data_dir {
            Some(dir) => Self::persistent(dir),
            None => Ok(Self::in_memory()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_queue_keeps_persistent_view() {
        let stores = Stores::with_log(Arc::new(MemoryStore::<Vec<u8>>::new()));

        let ctx = Context::new();
        ctx.put_with("AMOUNT", 1250i64, true);
        ctx.put("SCRATCH", "dropped");
        stores.retry.push("RETRY", ctx).unwrap();

        let retried = stores.retry.take_if_present("RETRY").unwrap().unwrap();
        assert_eq!(retried.get("AMOUNT").and_then(|v| v.as_i64()), Some(1250));
        assert!(!retried.contains("SCRATCH"));
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig::new("acquirer").with_data_dir(dir.path());
        let stores = Stores::from_config(&config).unwrap();

        stores.log.push("k", b"v".to_vec()).unwrap();
        assert_eq!(stores.log.read_all("k").unwrap(), vec![b"v".to_vec()]);
    }
}
