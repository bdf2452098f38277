//! Shared-cache contract for logharbor: leader election and cross-replica
//! log fanout over a single external key/value store.

mod cache;
mod memory;
mod redis_cache;

pub use cache::{CacheError, SharedCache, StreamFields, StreamMessage};
pub use memory::InMemorySharedCache;
pub use redis_cache::RedisSharedCache;
