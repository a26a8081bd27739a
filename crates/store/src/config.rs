//! Persistent store configuration

use std::path::PathBuf;

/// Configuration for a [`FjallStore`](crate::FjallStore)
#[derive(Clone)]
pub struct StoreConfig {
    /// Directory for storage data
    pub data_dir: PathBuf,

    /// Name of the partition holding the entries
    pub partition: String,

    /// Block cache size for Fjall (in bytes)
    pub block_cache_size: u64,

    /// Journal persistence after every write; `None` leaves flushing to Fjall
    pub persist_mode: Option<fjall::PersistMode>,
}

impl StoreConfig {
    /// Create a new config with the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            partition: "entries".to_string(),
            block_cache_size: 16 * 1024 * 1024, // 16 MB
            persist_mode: Some(fjall::PersistMode::SyncAll),
        }
    }

    /// Set partition name
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Set block cache size
    pub fn with_block_cache_size(mut self, size: u64) -> Self {
        self.block_cache_size = size;
        self
    }

    /// Set persist mode
    pub fn with_persist_mode(mut self, mode: Option<fjall::PersistMode>) -> Self {
        self.persist_mode = mode;
        self
    }
}
