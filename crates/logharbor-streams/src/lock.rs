use std::sync::Arc;
use std::time::Duration;

use logharbor_cache::SharedCache;

/// Leader-election lock for one log stream, layered on the shared cache's
/// compare-and-set primitives. Any backend failure is treated as loss of
/// leadership rather than propagated.
pub struct StreamLock {
    cache: Arc<dyn SharedCache>,
    key: String,
    value: String,
    ttl: Duration,
}

impl StreamLock {
    pub fn new(cache: Arc<dyn SharedCache>, key: String, value: String, ttl: Duration) -> Self {
        Self { cache, key, value, ttl }
    }

    pub async fn try_acquire(&self) -> bool {
        self.cache
            .set_if_absent(&self.key, &self.value, self.ttl)
            .await
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, key = %self.key, "lock acquire failed");
                false
            })
    }

    pub async fn try_extend(&self) -> bool {
        self.cache
            .compare_and_expire(&self.key, &self.value, self.ttl)
            .await
            .unwrap_or_else(|e| {
                tracing::debug!(error = %e, key = %self.key, "lock extend failed");
                false
            })
    }

    /// Release iff this lock still holds it. Idempotent: calling it while not
    /// holding the lock is a no-op.
    pub async fn release(&self) {
        if let Err(e) = self.cache.compare_and_delete(&self.key, &self.value).await {
            tracing::debug!(error = %e, key = %self.key, "lock release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logharbor_cache::InMemorySharedCache;

    fn lock(cache: &Arc<dyn SharedCache>, value: &str) -> StreamLock {
        StreamLock::new(cache.clone(), "stream-lock".to_string(), value.to_string(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn second_replica_cannot_acquire_while_first_holds_it() {
        let cache: Arc<dyn SharedCache> = Arc::new(InMemorySharedCache::new());
        let a = lock(&cache, "replica-a");
        let b = lock(&cache, "replica-b");

        assert!(a.try_acquire().await);
        assert!(!b.try_acquire().await);
    }

    #[tokio::test]
    async fn release_then_acquire_lets_another_replica_take_it() {
        let cache: Arc<dyn SharedCache> = Arc::new(InMemorySharedCache::new());
        let a = lock(&cache, "replica-a");
        let b = lock(&cache, "replica-b");

        assert!(a.try_acquire().await);
        a.release().await;
        assert!(b.try_acquire().await);
    }

    #[tokio::test]
    async fn only_the_holder_can_extend_its_own_lock() {
        let cache: Arc<dyn SharedCache> = Arc::new(InMemorySharedCache::new());
        let a = lock(&cache, "replica-a");
        let b = lock(&cache, "replica-b");

        assert!(a.try_acquire().await);
        assert!(!b.try_extend().await);
        assert!(a.try_extend().await);
    }
}
