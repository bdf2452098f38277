use std::collections::HashMap;
use std::sync::Arc;

use logharbor_k8s::inventory::{AppRef, ResourceInventory};
use logharbor_types::{GatewayError, HubConfig, ServerEvent, SubscribeOptions};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app_stream::AppStream;
use crate::hub::LogHub;
use crate::subscriber::Subscriber;

/// Deterministic key for one app stream: `(namespace, app, container, tail)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AppStreamKey {
    namespace: String,
    app: AppRef,
    container: String,
    tail: i64,
}

/// Process-wide registry of app streams, with the same lifecycle discipline
/// as the log hub.
pub struct AppStreamPool {
    config: Arc<HubConfig>,
    hub: Arc<LogHub>,
    inventory: Arc<dyn ResourceInventory>,
    streams: Mutex<HashMap<AppStreamKey, Arc<AppStream>>>,
}

impl AppStreamPool {
    pub fn new(config: Arc<HubConfig>, hub: Arc<LogHub>, inventory: Arc<dyn ResourceInventory>) -> Arc<Self> {
        Arc::new(Self { config, hub, inventory, streams: Mutex::new(HashMap::new()) })
    }

    /// Attach a subscriber to the app stream for `(namespace, app)`, creating
    /// it on demand. `container` and `tail` participate in the pool key, so
    /// two subscribers requesting different tails get independent streams.
    /// `options` missing entirely is an invalid request: no stream is
    /// created and no lookup happens. `ctx` ending detaches the subscriber
    /// automatically, same as dropping the returned `AppDetach`.
    pub async fn subscribe(
        self: &Arc<Self>,
        namespace: &str,
        app: AppRef,
        options: Option<SubscribeOptions>,
        ctx: CancellationToken,
    ) -> Result<(Subscriber, mpsc::Receiver<ServerEvent>, AppDetach), GatewayError> {
        let options = options.ok_or_else(|| GatewayError::InvalidRequest("no log options supplied".to_string()))?;
        let tail = self.config.stream.clamp_tail(Some(options.tail));

        let key = AppStreamKey { namespace: namespace.to_string(), app, container: options.container, tail };
        let stream = self.stream_for(&key);

        match stream.subscribe().await {
            Ok((sub, rx)) => {
                let detach = AppDetach { pool: self.clone(), key: key.clone(), stream: stream.clone(), subscriber_id: sub.id };

                let pool = self.clone();
                let subscriber_id = sub.id;
                tokio::spawn(async move {
                    ctx.cancelled().await;
                    pool.detach_app(&key, &stream, subscriber_id);
                });

                Ok((sub, rx, detach))
            }
            Err(e) => {
                // The initial reconciliation failed: this app stream never
                // started, so drop it from the registry and let the next
                // caller retry fresh.
                self.streams.lock().remove(&key);
                stream.shutdown();
                Err(e)
            }
        }
    }

    /// Remove a subscriber from its app stream and, if that leaves it idle,
    /// arm the idle-TTL eviction timer. Idempotent: safe to call more than
    /// once for the same subscriber (e.g. once from `ctx` cancellation and
    /// once from an explicit or dropped `AppDetach`).
    fn detach_app(self: &Arc<Self>, key: &AppStreamKey, stream: &Arc<AppStream>, subscriber_id: u64) {
        stream.unsubscribe(subscriber_id);
        if stream.subscriber_count() == 0 {
            let pool = self.clone();
            let key = key.clone();
            let idle_ttl = pool.config.stream.idle_ttl_seconds;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(idle_ttl)).await;
                pool.evict_if_idle(&key);
            });
        }
    }

    fn stream_for(self: &Arc<Self>, key: &AppStreamKey) -> Arc<AppStream> {
        let mut streams = self.streams.lock();
        if let Some(existing) = streams.get(key) {
            return existing.clone();
        }
        let stream = AppStream::new(
            key.namespace.clone(),
            key.app.clone(),
            key.container.clone(),
            key.tail,
            self.config.clone(),
            self.hub.clone(),
            self.inventory.clone(),
        );
        streams.insert(key.clone(), stream.clone());
        stream
    }

    fn evict_if_idle(&self, key: &AppStreamKey) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(key) {
            if stream.subscriber_count() == 0 {
                let stream = streams.remove(key).expect("key checked present above");
                stream.shutdown();
            }
        }
    }

    pub async fn stop(&self) {
        let streams: Vec<Arc<AppStream>> = self.streams.lock().drain().map(|(_, v)| v).collect();
        for stream in streams {
            stream.shutdown();
        }
    }
}

/// Detach handle returned from `subscribe`. Dropping it (explicitly via
/// `detach()`, or implicitly by letting it go out of scope) removes the
/// subscriber and, if the app stream becomes idle, arms an idle-TTL timer
/// that evicts it from the registry on expiry.
pub struct AppDetach {
    pool: Arc<AppStreamPool>,
    key: AppStreamKey,
    stream: Arc<AppStream>,
    subscriber_id: u64,
}

impl AppDetach {
    /// Detach now rather than waiting for this handle to drop. Equivalent to
    /// `drop(detach)`.
    pub fn detach(self) {}
}

impl Drop for AppDetach {
    fn drop(&mut self) {
        self.pool.detach_app(&self.key, &self.stream, self.subscriber_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use logharbor_k8s::inventory::{AppKind, InventoryError, LabelSelector, PodInfo};
    use logharbor_k8s::log_source::LogLineStream;
    use logharbor_types::Resume;
    use std::sync::Mutex as StdMutex;

    struct FakeInventory {
        pods: StdMutex<Vec<PodInfo>>,
    }

    #[async_trait]
    impl ResourceInventory for FakeInventory {
        async fn list_pods(&self, _namespace: &str) -> Result<Vec<PodInfo>, InventoryError> {
            Ok(self.pods.lock().unwrap().clone())
        }

        async fn resolve_app_selector(&self, _namespace: &str, _app: &AppRef) -> Result<LabelSelector, InventoryError> {
            Ok(LabelSelector::default())
        }

        async fn list_pods_matching(&self, _namespace: &str, _selector: &LabelSelector) -> Result<Vec<PodInfo>, InventoryError> {
            Ok(self.pods.lock().unwrap().clone())
        }
    }

    struct EmptyUpstream;

    #[async_trait]
    impl logharbor_k8s::log_source::UpstreamLogSource for EmptyUpstream {
        async fn follow(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: Option<&str>,
            _since_time: Option<chrono::DateTime<chrono::Utc>>,
            _tail_lines: Option<i64>,
        ) -> anyhow::Result<LogLineStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    fn test_pool() -> Arc<AppStreamPool> {
        let hub = Arc::new(LogHub::new(HubConfig::default(), None, Arc::new(EmptyUpstream)));
        let inventory: Arc<dyn ResourceInventory> = Arc::new(FakeInventory { pods: StdMutex::new(vec![PodInfo { name: "p1".into(), ready: true, restart_count: 0 }]) });
        AppStreamPool::new(Arc::new(hub.config().clone()), hub, inventory)
    }

    #[tokio::test]
    async fn subscribe_with_no_options_is_an_invalid_request() {
        let pool = test_pool();
        let app = AppRef { kind: AppKind::Deployment, name: "app".into() };
        let err = pool.subscribe("ns", app, None, CancellationToken::new()).await.expect_err("missing options rejected");
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn repeated_subscribe_with_same_key_reuses_one_app_stream() {
        let pool = test_pool();
        let app = AppRef { kind: AppKind::Deployment, name: "app".into() };
        let options = SubscribeOptions { container: String::new(), tail: 10, resume: Resume::default() };

        let (_s1, _r1, _d1) = pool.subscribe("ns", app.clone(), Some(options.clone()), CancellationToken::new()).await.expect("first subscribe succeeds");
        let (_s2, _r2, _d2) = pool.subscribe("ns", app, Some(options), CancellationToken::new()).await.expect("second subscribe succeeds");

        assert_eq!(pool.streams.lock().len(), 1);
    }

    #[tokio::test]
    async fn different_tail_produces_independent_app_streams() {
        let pool = test_pool();
        let app = AppRef { kind: AppKind::Deployment, name: "app".into() };
        let options_a = SubscribeOptions { container: String::new(), tail: 10, resume: Resume::default() };
        let options_b = SubscribeOptions { container: String::new(), tail: 50, resume: Resume::default() };

        let (_s1, _r1, _d1) = pool.subscribe("ns", app.clone(), Some(options_a), CancellationToken::new()).await.expect("first subscribe succeeds");
        let (_s2, _r2, _d2) = pool.subscribe("ns", app, Some(options_b), CancellationToken::new()).await.expect("second subscribe succeeds");

        assert_eq!(pool.streams.lock().len(), 2);
    }

    #[tokio::test]
    async fn cancelling_ctx_detaches_without_calling_detach_explicitly() {
        let pool = test_pool();
        let app = AppRef { kind: AppKind::Deployment, name: "app".into() };
        let options = SubscribeOptions { container: String::new(), tail: 10, resume: Resume::default() };
        let ctx = CancellationToken::new();

        let (_sub, _rx, detach) = pool.subscribe("ns", app, Some(options), ctx.clone()).await.expect("subscribe succeeds");
        assert_eq!(pool.streams.lock().len(), 1);

        ctx.cancel();
        tokio::task::yield_now().await;

        let stream = pool.streams.lock().values().next().cloned().expect("stream still registered");
        assert_eq!(stream.subscriber_count(), 0, "ctx cancellation should detach the subscriber");
        drop(detach); // already detached via ctx; dropping again is a harmless no-op
    }

    #[tokio::test]
    async fn dropping_the_handle_without_calling_detach_still_detaches() {
        let pool = test_pool();
        let app = AppRef { kind: AppKind::Deployment, name: "app".into() };
        let options = SubscribeOptions { container: String::new(), tail: 10, resume: Resume::default() };

        let (_sub, _rx, detach) = pool.subscribe("ns", app, Some(options), CancellationToken::new()).await.expect("subscribe succeeds");
        let stream = pool.streams.lock().values().next().cloned().expect("stream registered");
        assert_eq!(stream.subscriber_count(), 1);

        drop(detach);
        tokio::task::yield_now().await;

        assert_eq!(stream.subscriber_count(), 0);
    }
}
