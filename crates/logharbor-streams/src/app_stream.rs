use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use logharbor_k8s::inventory::{AppKind, InventoryError, PodInfo, ResourceInventory};
use logharbor_types::{GatewayError, HubConfig, LogEntry, MarkerKind, Resume, ServerEvent, StatsBody};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hub::{LogHub, PodDetach};
use crate::subscriber::{broadcast, new_subscriber, Subscriber};

#[derive(Clone, Copy)]
struct PodState {
    restart_count: i32,
    ready: bool,
}

struct PodTask {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl PodTask {
    fn stop(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

struct Inner {
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    pods: HashMap<String, PodState>,
    pod_tasks: HashMap<String, PodTask>,
    pod_set_hash: u64,
}

/// An `(namespace, app, container, tail)` app reference, owned by the app
/// stream it identifies. `AppKind` comes from `logharbor-k8s`'s inventory
/// contract; this alias keeps this module's signatures readable.
pub type AppRef = logharbor_k8s::inventory::AppRef;

/// Merged live view of all pods currently backing one app: one per
/// `(namespace, app, container, tail)`. Owns per-pod log-stream subscriptions
/// through the hub and synthesizes membership/readiness markers.
pub struct AppStream {
    namespace: String,
    app: AppRef,
    container: String,
    tail: i64,
    config: Arc<HubConfig>,
    hub: Arc<LogHub>,
    inventory: Arc<dyn ResourceInventory>,
    inner: Mutex<Inner>,
    subscriber_count: AtomicUsize,
    next_seq: AtomicU64,
    root_token: CancellationToken,
    start_lock: tokio::sync::Mutex<bool>,
}

impl AppStream {
    pub fn new(
        namespace: String,
        app: AppRef,
        container: String,
        tail: i64,
        config: Arc<HubConfig>,
        hub: Arc<LogHub>,
        inventory: Arc<dyn ResourceInventory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace,
            app,
            container,
            tail,
            config,
            hub,
            inventory,
            inner: Mutex::new(Inner {
                subscribers: HashMap::new(),
                next_subscriber_id: 1,
                pods: HashMap::new(),
                pod_tasks: HashMap::new(),
                pod_set_hash: 0,
            }),
            subscriber_count: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            root_token: CancellationToken::new(),
            start_lock: tokio::sync::Mutex::new(false),
        })
    }

    fn app_display(&self) -> String {
        match &self.app.kind {
            AppKind::Deployment => format!("deployment/{}", self.app.name),
            AppKind::StatefulSet => format!("statefulset/{}", self.app.name),
            AppKind::Custom(kind) => format!("{}/{}", kind.to_lowercase(), self.app.name),
        }
    }

    /// Attach a subscriber, running the initial reconciliation on first use.
    /// A failure to resolve the app on that first reconciliation is
    /// propagated here; every later failure degrades to an `error` marker.
    pub async fn subscribe(self: &Arc<Self>) -> Result<(Subscriber, mpsc::Receiver<ServerEvent>), GatewayError> {
        self.ensure_started().await?;

        let mut inner = self.inner.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let (sub, rx) = new_subscriber(id, self.config.subscriber.buffer_lines);
        inner.subscribers.insert(id, sub.clone());
        drop(inner);
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);

        Ok((sub, rx))
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.inner.lock().subscribers.remove(&id).is_some() {
            self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.root_token.cancel();
    }

    async fn ensure_started(self: &Arc<Self>) -> Result<(), GatewayError> {
        let mut started = self.start_lock.lock().await;
        if *started {
            return Ok(());
        }
        self.reconcile(true).await?;
        *started = true;
        drop(started);

        let this = self.clone();
        tokio::spawn(async move { this.run_loop().await });
        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        let mut resync = tokio::time::interval(Duration::from_secs(self.config.stream.app_resync_seconds.max(1)));
        resync.tick().await;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(15));
        let mut stats_tick = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = self.root_token.cancelled() => break,
                _ = resync.tick() => {
                    if let Err(e) = self.reconcile(false).await {
                        tracing::debug!(app = %self.app_display(), error = %e, "app stream reconciliation failed");
                    }
                }
                _ = heartbeat.tick() => {
                    self.broadcast_event(&ServerEvent::heartbeat(Utc::now()));
                }
                _ = stats_tick.tick() => {
                    self.emit_stats();
                }
            }
        }

        let pod_tasks: Vec<PodTask> = self.inner.lock().pod_tasks.drain().map(|(_, v)| v).collect();
        for task in pod_tasks {
            task.stop();
        }
        self.inner.lock().subscribers.clear();
    }

    fn broadcast_event(&self, event: &ServerEvent) {
        let subs: Vec<Subscriber> = self.inner.lock().subscribers.values().cloned().collect();
        broadcast(&subs, event);
    }

    fn emit_marker(&self, kind: MarkerKind, pod_name: &str, message: impl Into<String>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = LogEntry::marker(seq, Utc::now(), pod_name, kind, message);
        self.broadcast_event(&ServerEvent::from_entry(&entry));
    }

    /// Each subscriber gets its own dropped count and channel depth; only
    /// `sources` (the active pod-task count) is shared across subscribers.
    fn emit_stats(&self) {
        let inner = self.inner.lock();
        let sources = inner.pod_tasks.len();
        let subs: Vec<Subscriber> = inner.subscribers.values().cloned().collect();
        drop(inner);
        for sub in subs {
            let body = StatsBody { dropped: sub.dropped_count(), buffered: sub.channel_depth(), sources: Some(sources) };
            sub.try_send(ServerEvent::Stats { body });
        }
    }

    /// One reconciliation round. `initial` controls whether a resolution
    /// failure is propagated to the caller or degraded to a marker.
    async fn reconcile(self: &Arc<Self>, initial: bool) -> Result<(), GatewayError> {
        let selector = match self.inventory.resolve_app_selector(&self.namespace, &self.app).await {
            Ok(s) => s,
            Err(InventoryError::NotFound { .. }) => {
                if initial {
                    return Err(GatewayError::AppNotFound { namespace: self.namespace.clone(), app: self.app_display() });
                }
                self.emit_marker(MarkerKind::Error, "", format!("app '{}' not found", self.app_display()));
                return Ok(());
            }
            Err(e) => {
                if initial {
                    return Err(GatewayError::ResourceInventory(e.into()));
                }
                self.emit_marker(MarkerKind::Error, "", format!("selector resolution failed: {e}"));
                return Ok(());
            }
        };

        let pods = match self.inventory.list_pods_matching(&self.namespace, &selector).await {
            Ok(p) => p,
            Err(e) => {
                if initial {
                    return Err(GatewayError::ResourceInventory(e.into()));
                }
                self.emit_marker(MarkerKind::Error, "", format!("pod listing failed: {e}"));
                return Ok(());
            }
        };

        let desired: BTreeSet<String> = pods.iter().map(|p| p.name.clone()).collect();
        let hash = hash_pod_names(&desired);

        let skip_sync = {
            let inner = self.inner.lock();
            hash == inner.pod_set_hash && inner.pod_tasks.len() == desired.len() && !initial
        };

        if !skip_sync {
            self.sync_pods(&desired).await;
            self.inner.lock().pod_set_hash = hash;
        }

        self.apply_markers(&pods, initial);
        Ok(())
    }

    async fn sync_pods(self: &Arc<Self>, desired: &BTreeSet<String>) {
        let to_remove: Vec<String> = {
            let inner = self.inner.lock();
            inner.pod_tasks.keys().filter(|name| !desired.contains(*name)).cloned().collect()
        };
        for name in to_remove {
            if let Some(task) = self.inner.lock().pod_tasks.remove(&name) {
                task.stop();
            }
        }

        let to_add: Vec<String> = {
            let inner = self.inner.lock();
            desired.iter().filter(|name| !inner.pod_tasks.contains_key(name.as_str())).cloned().collect()
        };
        for name in to_add {
            self.spawn_pod_forwarder(name).await;
        }
    }

    /// Open a log-stream subscription for `pod_name` via the hub and spawn a
    /// task that forwards its replay then its live events into this app
    /// stream's subscribers, cancelled by its own child of the root token.
    async fn spawn_pod_forwarder(self: &Arc<Self>, pod_name: String) {
        let token = self.root_token.child_token();
        let (_sub, rx, replay, detach) = self
            .hub
            .subscribe_pod(&self.namespace, &pod_name, &self.container, self.tail, Resume::default(), token.clone())
            .await;

        let child = token.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.forward_pod_events(child, replay, rx, detach).await });
        self.inner.lock().pod_tasks.insert(pod_name, PodTask { token, handle });
    }

    async fn forward_pod_events(self: Arc<Self>, token: CancellationToken, replay: Vec<LogEntry>, mut rx: mpsc::Receiver<ServerEvent>, detach: PodDetach) {
        for entry in replay {
            self.broadcast_event(&ServerEvent::from_entry(&entry));
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.broadcast_event(&event),
                    None => break,
                },
            }
        }
        detach.detach();
    }

    fn apply_markers(&self, pods: &[PodInfo], initial: bool) {
        let mut inner = self.inner.lock();

        let desired: std::collections::HashSet<&str> = pods.iter().map(|p| p.name.as_str()).collect();
        let removed: Vec<String> = inner.pods.keys().filter(|n| !desired.contains(n.as_str())).cloned().collect();
        for name in &removed {
            inner.pods.remove(name);
        }

        let mut to_emit: Vec<(MarkerKind, String, String)> = Vec::new();
        for name in &removed {
            to_emit.push((MarkerKind::PodRemoved, name.clone(), format!("pod {name} removed")));
        }

        for pod in pods {
            match inner.pods.get(&pod.name).copied() {
                None => {
                    inner.pods.insert(pod.name.clone(), PodState { restart_count: pod.restart_count, ready: pod.ready });
                    if !initial {
                        to_emit.push((MarkerKind::PodAdded, pod.name.clone(), format!("pod {} added", pod.name)));
                    }
                }
                Some(prev) => {
                    if pod.restart_count > prev.restart_count {
                        to_emit.push((
                            MarkerKind::PodRestart,
                            pod.name.clone(),
                            format!("pod {} restarted ({} -> {})", pod.name, prev.restart_count, pod.restart_count),
                        ));
                    }
                    if pod.ready != prev.ready {
                        let kind = if pod.ready { MarkerKind::PodReady } else { MarkerKind::PodNotReady };
                        to_emit.push((kind, pod.name.clone(), format!("pod {} {}", pod.name, if pod.ready { "ready" } else { "not ready" })));
                    }
                    inner.pods.insert(pod.name.clone(), PodState { restart_count: pod.restart_count, ready: pod.ready });
                }
            }
        }
        drop(inner);

        for (kind, pod_name, message) in to_emit {
            self.emit_marker(kind, &pod_name, message);
        }
    }
}

fn hash_pod_names(names: &BTreeSet<String>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for name in names {
        name.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use logharbor_k8s::inventory::LabelSelector;
    use logharbor_k8s::log_source::LogLineStream;
    use std::sync::Mutex as StdMutex;

    struct FakeInventory {
        pods: StdMutex<Vec<PodInfo>>,
        not_found: bool,
    }

    #[async_trait::async_trait]
    impl ResourceInventory for FakeInventory {
        async fn list_pods(&self, _namespace: &str) -> Result<Vec<PodInfo>, InventoryError> {
            Ok(self.pods.lock().unwrap().clone())
        }

        async fn resolve_app_selector(&self, namespace: &str, app: &AppRef) -> Result<LabelSelector, InventoryError> {
            if self.not_found {
                return Err(InventoryError::NotFound { namespace: namespace.to_string(), kind: app.kind.clone(), name: app.name.clone() });
            }
            Ok(LabelSelector::default())
        }

        async fn list_pods_matching(&self, _namespace: &str, _selector: &LabelSelector) -> Result<Vec<PodInfo>, InventoryError> {
            Ok(self.pods.lock().unwrap().clone())
        }
    }

    struct EmptyUpstream;

    #[async_trait::async_trait]
    impl logharbor_k8s::log_source::UpstreamLogSource for EmptyUpstream {
        async fn follow(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: Option<&str>,
            _since_time: Option<chrono::DateTime<Utc>>,
            _tail_lines: Option<i64>,
        ) -> anyhow::Result<LogLineStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    fn pod(name: &str, restart_count: i32, ready: bool) -> PodInfo {
        PodInfo { name: name.to_string(), ready, restart_count }
    }

    fn new_app_stream(inventory: Arc<FakeInventory>) -> Arc<AppStream> {
        let hub = Arc::new(LogHub::new(HubConfig::default(), None, Arc::new(EmptyUpstream)));
        AppStream::new(
            "ns".into(),
            AppRef { kind: AppKind::Deployment, name: "app".into() },
            String::new(),
            10,
            Arc::new(HubConfig::default()),
            hub,
            inventory,
        )
    }

    #[tokio::test]
    async fn initial_reconcile_records_pods_without_added_markers() {
        let inventory = Arc::new(FakeInventory { pods: StdMutex::new(vec![pod("p1", 0, true), pod("p2", 0, true)]), not_found: false });
        let app_stream = new_app_stream(inventory);

        let (sub, _rx) = app_stream.subscribe().await.expect("initial reconcile succeeds");
        assert_eq!(app_stream.subscriber_count(), 1);
        drop(sub);
    }

    #[tokio::test]
    async fn initial_reconcile_propagates_app_not_found() {
        let inventory = Arc::new(FakeInventory { pods: StdMutex::new(vec![]), not_found: true });
        let app_stream = new_app_stream(inventory);

        let err = app_stream.subscribe().await.expect_err("selector resolution fails");
        assert!(matches!(err, GatewayError::AppNotFound { .. }));
        assert_eq!(app_stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn later_reconcile_emits_restart_and_readiness_markers() {
        let inventory = Arc::new(FakeInventory { pods: StdMutex::new(vec![pod("p1", 0, true)]), not_found: false });
        let app_stream = new_app_stream(inventory.clone());

        let (_sub, mut rx) = app_stream.subscribe().await.expect("initial reconcile succeeds");

        *inventory.pods.lock().unwrap() = vec![pod("p1", 1, false)];
        app_stream.reconcile(false).await.expect("later reconcile degrades instead of erroring");

        let mut saw_restart = false;
        let mut saw_not_ready = false;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::Marker { body, .. } = event {
                match body.kind.as_deref() {
                    Some("pod-restart") => saw_restart = true,
                    Some("pod-not-ready") => saw_not_ready = true,
                    _ => {}
                }
            }
        }
        assert!(saw_restart, "expected a pod-restart marker");
        assert!(saw_not_ready, "expected a pod-not-ready marker");

        // Reconciling again with the same restart count must not repeat the marker.
        app_stream.reconcile(false).await.expect("steady-state reconcile degrades instead of erroring");
        let mut saw_second_restart = false;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::Marker { body, .. } = event {
                if body.kind.as_deref() == Some("pod-restart") {
                    saw_second_restart = true;
                }
            }
        }
        assert!(!saw_second_restart, "restart marker must not repeat until the count increases again");
    }

    #[tokio::test]
    async fn pod_removed_from_inventory_emits_removal_marker() {
        let inventory = Arc::new(FakeInventory { pods: StdMutex::new(vec![pod("p1", 0, true), pod("p2", 0, true)]), not_found: false });
        let app_stream = new_app_stream(inventory.clone());

        let (_sub, mut rx) = app_stream.subscribe().await.expect("initial reconcile succeeds");

        *inventory.pods.lock().unwrap() = vec![pod("p1", 0, true)];
        app_stream.reconcile(false).await.expect("later reconcile degrades instead of erroring");

        let mut saw_removed = false;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::Marker { body, .. } = event {
                if body.kind.as_deref() == Some("pod-removed") {
                    saw_removed = true;
                }
            }
        }
        assert!(saw_removed, "expected a pod-removed marker");
    }
}
