//! Persistent store on top of Fjall
//!
//! Each queued value is a separate Fjall entry keyed by
//! `key ++ 0x00 ++ sequence (u64, big-endian)`, so a prefix scan over
//! `key ++ 0x00` yields the queue in order. Values carry an 8-byte expiry
//! header (milliseconds since the Unix epoch, zero for no expiry).

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::store::Store;
use async_trait::async_trait;
use fjall::{Keyspace, Partition, PartitionCreateOptions};
use parking_lot::Mutex;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

const KEY_SEPARATOR: u8 = 0x00;
const EXPIRY_HEADER_LEN: usize = 8;
const SEQUENCE_LEN: usize = 8;

/// Durable byte store backed by a Fjall keyspace
pub struct FjallStore {
    keyspace: Keyspace,
    partition: Partition,
    persist_mode: Option<fjall::PersistMode>,

    /// Serializes read-modify-write sequences on the partition
    write_lock: Mutex<()>,

    changes: Notify,
}

impl FjallStore {
    /// Open (or create) a store in `path` with default settings
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(StoreConfig::new(path.as_ref()))
    }

    /// Open (or create) a store with custom config
    pub fn with_config(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let keyspace = fjall::Config::new(&config.data_dir)
            .cache_size(config.block_cache_size)
            .open()?;

        let partition = keyspace.open_partition(
            &config.partition,
            PartitionCreateOptions::default().block_size(16 * 1024),
        )?;

        tracing::debug!(
            "Opened store partition {} at {:?}",
            config.partition,
            config.data_dir
        );

        Ok(Self {
            keyspace,
            partition,
            persist_mode: config.persist_mode,
            write_lock: Mutex::new(()),
            changes: Notify::new(),
        })
    }

    /// Flush the journal if configured to do so after writes
    fn persist(&self) -> Result<()> {
        if let Some(mode) = self.persist_mode {
            self.keyspace.persist(mode)?;
        }
        Ok(())
    }

    /// Live entries under `key` as (fjall key, payload), oldest first.
    ///
    /// Expired entries are collected into `expired` when provided.
    fn scan(
        &self,
        key: &str,
        mut expired: Option<&mut Vec<Vec<u8>>>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let now = now_millis();
        let mut live = Vec::new();

        for item in self.partition.prefix(queue_prefix(key)) {
            let (entry_key, raw) = item?;
            let (expires_at, payload) = split_value(key, &raw)?;
            if expires_at != 0 && expires_at <= now {
                if let Some(expired) = expired.as_deref_mut() {
                    expired.push(entry_key.to_vec());
                }
                continue;
            }
            live.push((entry_key.to_vec(), payload.to_vec()));
        }

        Ok(live)
    }

    /// Next sequence number for `key`
    fn next_sequence(&self, key: &str) -> Result<u64> {
        match self.partition.prefix(queue_prefix(key)).next_back() {
            Some(item) => {
                let (entry_key, _) = item?;
                let seq = parse_sequence(&entry_key)
                    .ok_or_else(|| StoreError::Corrupted(key.to_string()))?;
                Ok(seq + 1)
            }
            None => Ok(0),
        }
    }

    /// Fjall keys of every entry under `key`, live or not
    fn entry_keys(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in self.partition.prefix(queue_prefix(key)) {
            let (entry_key, _) = item?;
            keys.push(entry_key.to_vec());
        }
        Ok(keys)
    }
}

#[async_trait]
impl Store<Vec<u8>> for FjallStore {
    fn push_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            let seq = self.next_sequence(key)?;
            self.partition
                .insert(entry_key(key, seq), encode_value(&value, ttl))?;
        }
        self.persist()?;
        self.changes.notify_waiters();
        Ok(())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            let mut batch = self.keyspace.batch();
            for existing in self.entry_keys(key)? {
                batch.remove(&self.partition, existing);
            }
            batch.insert(&self.partition, entry_key(key, 0), encode_value(&value, None));
            batch.commit()?;
        }
        self.persist()?;
        self.changes.notify_waiters();
        Ok(())
    }

    fn take_if_present(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let taken = {
            let _guard = self.write_lock.lock();
            let mut expired = Vec::new();
            let live = self.scan(key, Some(&mut expired))?;

            let head = live.into_iter().next();
            if head.is_none() && expired.is_empty() {
                return Ok(None);
            }

            let mut batch = self.keyspace.batch();
            for stale in expired {
                batch.remove(&self.partition, stale);
            }
            if let Some((entry_key, _)) = &head {
                batch.remove(&self.partition, entry_key.clone());
            }
            batch.commit()?;

            head.map(|(_, payload)| payload)
        };

        self.persist()?;
        Ok(taken)
    }

    fn read_if_present(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .scan(key, None)?
            .into_iter()
            .next()
            .map(|(_, payload)| payload))
    }

    fn read_all(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .scan(key, None)?
            .into_iter()
            .map(|(_, payload)| payload)
            .collect())
    }

    fn remove(&self, key: &str) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            let keys = self.entry_keys(key)?;
            if keys.is_empty() {
                return Ok(());
            }
            let mut batch = self.keyspace.batch();
            for existing in keys {
                batch.remove(&self.partition, existing);
            }
            batch.commit()?;
        }
        self.persist()?;
        self.changes.notify_waiters();
        Ok(())
    }

    fn changes(&self) -> &Notify {
        &self.changes
    }
}

fn queue_prefix(key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 1);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn entry_key(key: &str, seq: u64) -> Vec<u8> {
    let mut entry_key = queue_prefix(key);
    entry_key.extend_from_slice(&seq.to_be_bytes());
    entry_key
}

fn parse_sequence(entry_key: &[u8]) -> Option<u64> {
    let start = entry_key.len().checked_sub(SEQUENCE_LEN)?;
    let bytes: [u8; SEQUENCE_LEN] = entry_key[start..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn encode_value(payload: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let expires_at = ttl
        .map(|ttl| now_millis().saturating_add(ttl.as_millis() as u64).max(1))
        .unwrap_or(0);

    let mut value = Vec::with_capacity(EXPIRY_HEADER_LEN + payload.len());
    value.extend_from_slice(&expires_at.to_be_bytes());
    value.extend_from_slice(payload);
    value
}

fn split_value<'a>(key: &str, raw: &'a [u8]) -> Result<(u64, &'a [u8])> {
    if raw.len() < EXPIRY_HEADER_LEN {
        return Err(StoreError::Corrupted(key.to_string()));
    }
    let (header, payload) = raw.split_at(EXPIRY_HEADER_LEN);
    let mut buf = [0u8; EXPIRY_HEADER_LEN];
    buf.copy_from_slice(header);
    Ok((u64::from_be_bytes(buf), payload))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
