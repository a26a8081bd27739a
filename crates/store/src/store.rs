//! Store trait shared by every backend

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Key/value store where each key holds a FIFO queue of values
///
/// The non-blocking operations are synchronous; `take` and `read` block (up
/// to an optional timeout) until a value is present. Backends only need to
/// signal [`Store::changes`] after every write for the blocking operations to
/// work.
#[async_trait]
pub trait Store<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Append a value to the queue under `key`
    fn push(&self, key: &str, value: V) -> Result<()> {
        self.push_with_ttl(key, value, None)
    }

    /// Append a value that disappears once `ttl` has elapsed
    fn push_with_ttl(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()>;

    /// Replace everything under `key` with a single value
    fn put(&self, key: &str, value: V) -> Result<()>;

    /// Remove and return the head of the queue, if any
    fn take_if_present(&self, key: &str) -> Result<Option<V>>;

    /// Return the head of the queue without removing it
    fn read_if_present(&self, key: &str) -> Result<Option<V>>;

    /// Every live value under `key`, oldest first
    fn read_all(&self, key: &str) -> Result<Vec<V>>;

    /// Drop every value under `key`
    fn remove(&self, key: &str) -> Result<()>;

    /// Signalled after every write
    fn changes(&self) -> &Notify;

    /// Remove and return the head, waiting up to `timeout` (forever if `None`)
    async fn take(&self, key: &str, timeout: Option<Duration>) -> Result<Option<V>> {
        wait_for(self.changes(), timeout, || self.take_if_present(key)).await
    }

    /// Return the head without removing it, waiting up to `timeout`
    async fn read(&self, key: &str, timeout: Option<Duration>) -> Result<Option<V>> {
        wait_for(self.changes(), timeout, || self.read_if_present(key)).await
    }
}

/// Poll until `poll` yields a value or the deadline passes.
///
/// The notification is armed before polling so a write landing between the
/// poll and the wait is never missed.
pub(crate) async fn wait_for<V, F>(
    changes: &Notify,
    timeout: Option<Duration>,
    mut poll: F,
) -> Result<Option<V>>
where
    F: FnMut() -> Result<Option<V>>,
{
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let notified = changes.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = poll()? {
            return Ok(Some(value));
        }

        match deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
            None => notified.await,
        }
    }
}
