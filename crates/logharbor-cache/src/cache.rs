use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Fields written to the per-stream shared-cache entry on append, and read
/// back on range/tail/blocking-read queries.
#[derive(Clone, Debug, Default)]
pub struct StreamFields {
    pub ts: String,
    pub msg: String,
    pub pod: String,
    pub container: String,
    pub seq: String,
}

#[derive(Clone, Debug)]
pub struct StreamMessage {
    pub id: String,
    pub fields: StreamFields,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("shared cache backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Contract consumed by the log streaming fabric from an external shared
/// cache. Used for both leader election (`set_if_absent` +
/// `compare_and_expire` + `compare_and_delete`) and cross-replica fanout (the
/// `stream_*` family). `compare_and_expire`/`compare_and_delete` must be
/// atomic check-then-act: a plain `EXPIRE`/`DEL` would race with another
/// replica that has since taken the lock.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Append `fields` to the stream at `key`, trimming to approximately
    /// `max_len` entries. Returns the assigned message id.
    async fn stream_append(&self, key: &str, fields: StreamFields, max_len: usize) -> Result<String, CacheError>;

    /// Fetch up to `count` of the newest entries, in chronological order.
    async fn stream_tail(&self, key: &str, count: usize) -> Result<Vec<StreamMessage>, CacheError>;

    /// Fetch all entries strictly after `after_id`, in chronological order.
    async fn stream_after(&self, key: &str, after_id: &str) -> Result<Vec<StreamMessage>, CacheError>;

    /// Block for up to `block` waiting for new entries after `after_id`;
    /// returns immediately with whatever arrived, or empty on timeout.
    async fn stream_read_blocking(&self, key: &str, after_id: &str, block: Duration) -> Result<Vec<StreamMessage>, CacheError>;

    /// Atomically set `key` to `value` with the given TTL, iff it does not
    /// already exist. Returns whether the set happened (i.e. whether the
    /// lock was acquired).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Atomically extend `key`'s TTL iff its current value still equals
    /// `value`. Returns whether the extension happened.
    async fn compare_and_expire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Atomically delete `key` iff its current value still equals `value`.
    /// Returns whether the delete happened.
    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, CacheError>;

    /// Release any resources held by this client. A no-op for most
    /// implementations; present so the hub can shut it down deterministically.
    async fn close(&self) {}
}
