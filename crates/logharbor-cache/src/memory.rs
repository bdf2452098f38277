use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cache::{CacheError, SharedCache, StreamFields, StreamMessage};

#[derive(Clone)]
struct StoredEntry {
    id: (u64, u64),
    fields: StreamFields,
}

fn format_id(id: (u64, u64)) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(s: &str) -> (u64, u64) {
    match s.split_once('-') {
        Some((ms, seq)) => (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
        None => (s.parse().unwrap_or(0), 0),
    }
}

struct Lock {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Vec<StoredEntry>>,
    locks: HashMap<String, Lock>,
    next_seq: u64,
}

/// In-memory [`SharedCache`] fake for tests: no network, no real atomicity
/// beyond a process-local mutex, but the same semantics (approximate
/// trimming, compare-and-set lock primitives, blocking reads) as
/// [`crate::RedisSharedCache`].
pub struct InMemorySharedCache {
    state: Mutex<State>,
    notify: Arc<Notify>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn stream_append(&self, key: &str, fields: StreamFields, max_len: usize) -> Result<String, CacheError> {
        let id = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let seq = state.next_seq;
            let ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let id = (ms, seq);
            let entries = state.streams.entry(key.to_string()).or_default();
            entries.push(StoredEntry { id, fields });
            while entries.len() > max_len {
                entries.remove(0);
            }
            id
        };
        self.notify.notify_waiters();
        Ok(format_id(id))
    }

    async fn stream_tail(&self, key: &str, count: usize) -> Result<Vec<StreamMessage>, CacheError> {
        let state = self.state.lock();
        let entries = state.streams.get(key).cloned().unwrap_or_default();
        let start = entries.len().saturating_sub(count);
        Ok(entries[start..]
            .iter()
            .map(|e| StreamMessage { id: format_id(e.id), fields: e.fields.clone() })
            .collect())
    }

    async fn stream_after(&self, key: &str, after_id: &str) -> Result<Vec<StreamMessage>, CacheError> {
        let after = parse_id(after_id);
        let state = self.state.lock();
        let entries = state.streams.get(key).cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|e| e.id > after)
            .map(|e| StreamMessage { id: format_id(e.id), fields: e.fields })
            .collect())
    }

    async fn stream_read_blocking(&self, key: &str, after_id: &str, block: Duration) -> Result<Vec<StreamMessage>, CacheError> {
        let deadline = Instant::now() + block;
        loop {
            let found = self.stream_after(key, after_id).await?;
            if !found.is_empty() {
                return Ok(found);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(existing) = state.locks.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        state.locks.insert(key.to_string(), Lock { value: value.to_string(), expires_at: now + ttl });
        Ok(true)
    }

    async fn compare_and_expire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.locks.get_mut(key) {
            Some(lock) if lock.value == value && lock.expires_at > now => {
                lock.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        match state.locks.get(key) {
            Some(lock) if lock.value == value => {
                state.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
