//! Context implementation

use crate::error::{ContextError, Result};
use crate::profiler::Profiler;
use crate::trace::TraceLog;
use crate::value::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tally_store::Persist;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Reserved key of the lazily created [`TraceLog`]
pub const TRACE_LOG: &str = "TRACE_LOG";

/// Reserved key of the lazily created [`Profiler`]
pub const PROFILER: &str = "PROFILER";

/// Version tag written at the start of every encoded context
pub const CONTEXT_VERSION: u8 = 1;

type Object = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
enum Slot {
    Value(Value),
    Object(Object),
}

#[derive(Default)]
struct Entries {
    transient: HashMap<String, Slot>,
    /// Always a subset of the transient keys, and only ever `Slot::Value`s
    persistent: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<Entries>,
    changes: Notify,
}

/// Mutable data shared by all participants of one transaction
///
/// Cloning a `Context` yields another handle to the same data, which is how
/// results are handed back across tasks (see [`Context::get_timeout`]).
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the transient view.
    ///
    /// A key that is already persistent stays persistent with the new value.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) {
        {
            let mut entries = self.inner.entries.lock();
            entries
                .transient
                .insert(key.into(), Slot::Value(value.into()));
        }
        self.inner.changes.notify_waiters();
    }

    /// Insert a value, choosing whether it belongs to the persistent view
    pub fn put_with(&self, key: impl Into<String>, value: impl Into<Value>, persist: bool) {
        let key = key.into();
        {
            let mut entries = self.inner.entries.lock();
            if persist {
                entries.persistent.insert(key.clone());
            } else {
                entries.persistent.remove(&key);
            }
            entries.transient.insert(key, Slot::Value(value.into()));
        }
        self.inner.changes.notify_waiters();
    }

    /// Insert an in-process object; objects never reach the persistent view
    pub fn put_object<T: Any + Send + Sync>(&self, key: impl Into<String>, object: T) {
        let key = key.into();
        {
            let mut entries = self.inner.entries.lock();
            entries.persistent.remove(&key);
            entries.transient.insert(key, Slot::Object(Arc::new(object)));
        }
        self.inner.changes.notify_waiters();
    }

    /// Get a value; `None` if absent or if the key holds an object
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.inner.entries.lock().transient.get(key) {
            Some(Slot::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Get a value, falling back to `default`
    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.get(key).unwrap_or_else(|| default.into())
    }

    /// Get an object of type `T`
    pub fn get_object<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.inner.entries.lock().transient.get(key) {
            Some(Slot::Object(object)) => object.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Wait up to `timeout` for a value to appear under `key`
    pub async fn get_timeout(&self, key: &str, timeout: Duration) -> Option<Value> {
        self.wait_for(timeout, || self.get(key)).await
    }

    /// Wait up to `timeout` for an object of type `T` to appear under `key`
    pub async fn get_object_timeout<T: Any + Send + Sync>(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Option<Arc<T>> {
        self.wait_for(timeout, || self.get_object::<T>(key)).await
    }

    async fn wait_for<T>(&self, timeout: Duration, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = poll() {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Remove `key` from both views; returns whether it was present
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        entries.persistent.remove(key);
        entries.transient.remove(key).is_some()
    }

    /// Opt an existing value into the persistent view
    pub fn persist(&self, key: &str) -> Result<()> {
        let mut entries = self.inner.entries.lock();
        match entries.transient.get(key) {
            Some(Slot::Value(_)) => {
                entries.persistent.insert(key.to_string());
                Ok(())
            }
            Some(Slot::Object(_)) => Err(ContextError::NotPersistable(key.to_string())),
            None => Err(ContextError::NotFound(key.to_string())),
        }
    }

    /// Drop `key` from the persistent view only; returns whether it was there
    pub fn evict(&self, key: &str) -> bool {
        self.inner.entries.lock().persistent.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().transient.contains_key(key)
    }

    pub fn is_persistent(&self, key: &str) -> bool {
        self.inner.entries.lock().persistent.contains(key)
    }

    /// Every key of the transient view, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.lock().transient.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Every key of the persistent view, sorted
    pub fn persistent_keys(&self) -> Vec<String> {
        self.inner.entries.lock().persistent.iter().cloned().collect()
    }

    /// The transaction's trace log, created on first use
    pub fn trace_log(&self) -> Arc<TraceLog> {
        self.get_or_insert_object(TRACE_LOG, TraceLog::new)
    }

    /// The transaction's profiler, created on first use
    pub fn profiler(&self) -> Arc<Profiler> {
        self.get_or_insert_object(PROFILER, Profiler::new)
    }

    /// Append a message to the trace log
    pub fn log(&self, message: impl Into<String>) {
        self.trace_log().record(message);
    }

    /// Get the object of type `T` under `key`, creating it if absent.
    ///
    /// Check and insert happen under one lock, so concurrent callers all end
    /// up with the same object. Anything else stored under `key` is replaced.
    pub fn get_or_insert_object<T: Any + Send + Sync>(
        &self,
        key: &str,
        create: impl FnOnce() -> T,
    ) -> Arc<T> {
        if let Some(existing) = self.get_object::<T>(key) {
            return existing;
        }

        let mut entries = self.inner.entries.lock();
        if let Some(Slot::Object(object)) = entries.transient.get(key) {
            if let Ok(existing) = object.clone().downcast::<T>() {
                return existing;
            }
        }

        let created = Arc::new(create());
        let object: Object = created.clone();
        entries.persistent.remove(key);
        entries.transient.insert(key.to_string(), Slot::Object(object));
        drop(entries);
        self.inner.changes.notify_waiters();
        created
    }

    /// Encode the persistent view: version tag, entry count, then the
    /// (key, value) pairs sorted by key
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let pairs: Vec<(String, Value)> = {
            let entries = self.inner.entries.lock();
            entries
                .persistent
                .iter()
                .filter_map(|key| match entries.transient.get(key) {
                    Some(Slot::Value(value)) => Some((key.clone(), value.clone())),
                    _ => None,
                })
                .collect()
        };

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&(CONTEXT_VERSION, pairs), &mut bytes)
            .map_err(|e| ContextError::Encoding(format!("Failed to serialize context: {}", e)))?;
        Ok(bytes)
    }

    /// Rebuild a context holding exactly the encoded persistent entries
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (version, body): (u8, ciborium::Value) = ciborium::de::from_reader(bytes)
            .map_err(|e| ContextError::Encoding(format!("Failed to deserialize context: {}", e)))?;

        if version != CONTEXT_VERSION {
            return Err(ContextError::UnsupportedVersion(version));
        }

        let pairs: Vec<(String, Value)> = body
            .deserialized()
            .map_err(|e| ContextError::Encoding(format!("Failed to decode entries: {}", e)))?;

        let mut entries = Entries::default();
        for (key, value) in pairs {
            entries.persistent.insert(key.clone());
            entries.transient.insert(key, Slot::Value(value));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(entries),
                changes: Notify::new(),
            }),
        })
    }

    /// Whether two handles point to the same context
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Persist for Context {
    fn to_bytes(&self) -> std::result::Result<Vec<u8>, String> {
        Context::to_bytes(self).map_err(|e| e.to_string())
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        Context::from_bytes(bytes).map_err(|e| e.to_string())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.entries.lock();
        let mut keys: Vec<&String> = entries.transient.keys().collect();
        keys.sort();
        f.debug_struct("Context")
            .field("keys", &keys)
            .field("persistent", &entries.persistent)
            .finish()
    }
}
