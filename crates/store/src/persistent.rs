//! Typed values over a byte store

use crate::error::{Result, StoreError};
use crate::store::Store;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Values that can cross a durability boundary
pub trait Persist: Sized {
    /// Serialize to bytes for persistence
    fn to_bytes(&self) -> std::result::Result<Vec<u8>, String>;

    /// Deserialize from bytes
    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String>;
}

/// Store of typed values encoded into an underlying byte store
///
/// Whatever does not survive [`Persist::to_bytes`] is lost on the way in.
pub struct PersistentStore<V> {
    inner: Arc<dyn Store<Vec<u8>>>,
    _phantom: PhantomData<fn() -> V>,
}

impl<V: Persist> PersistentStore<V> {
    pub fn new(inner: Arc<dyn Store<Vec<u8>>>) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    fn encode(value: &V) -> Result<Vec<u8>> {
        value.to_bytes().map_err(StoreError::Codec)
    }

    fn decode(bytes: Option<Vec<u8>>) -> Result<Option<V>> {
        bytes
            .map(|bytes| V::from_bytes(&bytes).map_err(StoreError::Codec))
            .transpose()
    }
}

#[async_trait]
impl<V> Store<V> for PersistentStore<V>
where
    V: Persist + Clone + Send + Sync + 'static,
{
    fn push_with_ttl(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        self.inner.push_with_ttl(key, Self::encode(&value)?, ttl)
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        self.inner.put(key, Self::encode(&value)?)
    }

    fn take_if_present(&self, key: &str) -> Result<Option<V>> {
        Self::decode(self.inner.take_if_present(key)?)
    }

    fn read_if_present(&self, key: &str) -> Result<Option<V>> {
        Self::decode(self.inner.read_if_present(key)?)
    }

    fn read_all(&self, key: &str) -> Result<Vec<V>> {
        self.inner
            .read_all(key)?
            .iter()
            .map(|bytes| V::from_bytes(bytes).map_err(StoreError::Codec))
            .collect()
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }

    fn changes(&self) -> &Notify {
        self.inner.changes()
    }

    async fn take(&self, key: &str, timeout: Option<Duration>) -> Result<Option<V>> {
        Self::decode(self.inner.take(key, timeout).await?)
    }

    async fn read(&self, key: &str, timeout: Option<Duration>) -> Result<Option<V>> {
        Self::decode(self.inner.read(key, timeout).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[derive(Debug, Clone, PartialEq)]
    struct Amount(u64);

    impl Persist for Amount {
        fn to_bytes(&self) -> std::result::Result<Vec<u8>, String> {
            Ok(self.0.to_be_bytes().to_vec())
        }

        fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
            let buf: [u8; 8] = bytes
                .try_into()
                .map_err(|_| format!("expected 8 bytes, got {}", bytes.len()))?;
            Ok(Amount(u64::from_be_bytes(buf)))
        }
    }

    #[tokio::test]
    async fn test_typed_values_through_byte_store() {
        let bytes: Arc<dyn Store<Vec<u8>>> = Arc::new(MemoryStore::<Vec<u8>>::new());
        let store = PersistentStore::<Amount>::new(bytes.clone());

        store.push("amounts", Amount(100)).unwrap();
        store.push("amounts", Amount(250)).unwrap();

        assert_eq!(
            store.read_all("amounts").unwrap(),
            vec![Amount(100), Amount(250)]
        );
        assert_eq!(
            store.take("amounts", Some(Duration::from_millis(10))).await.unwrap(),
            Some(Amount(100))
        );
        assert_eq!(
            bytes.read_if_present("amounts").unwrap(),
            Some(250u64.to_be_bytes().to_vec())
        );
    }

    #[test]
    fn test_undecodable_value_is_a_codec_error() {
        let bytes: Arc<dyn Store<Vec<u8>>> = Arc::new(MemoryStore::<Vec<u8>>::new());
        bytes.push("amounts", vec![1, 2, 3]).unwrap();

        let store = PersistentStore::<Amount>::new(bytes);
        assert!(matches!(
            store.take_if_present("amounts"),
            Err(StoreError::Codec(_))
        ));
    }
}
