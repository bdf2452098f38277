use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use logharbor_cache::SharedCache;
use logharbor_k8s::UpstreamLogSource;
use logharbor_types::{AggregateStats, HubConfig, LogEntry, Resume, ServerEvent, StatusSnapshot, StreamKey};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::log_stream::LogStream;
use crate::subscriber::Subscriber;

/// Process-wide registry of log streams: creates them on demand, binds
/// subscribers, times out idle streams, and owns the shared-cache client.
/// Modeled on a single-owner collection keyed by a canonical string,
/// generalized to a process-wide map.
pub struct LogHub {
    config: Arc<HubConfig>,
    cache: Option<Arc<dyn SharedCache>>,
    upstream: Arc<dyn UpstreamLogSource>,
    lock_value: Arc<str>,
    streams: Mutex<HashMap<StreamKey, Arc<LogStream>>>,
}

/// 8 random bytes, hex-encoded; falls back to a high-resolution timestamp if
/// randomness is unavailable.
fn generate_process_identifier() -> Arc<str> {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    if hex.chars().all(|c| c == '0') {
        return Arc::from(format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default()));
    }
    Arc::from(hex)
}

impl LogHub {
    pub fn new(config: HubConfig, cache: Option<Arc<dyn SharedCache>>, upstream: Arc<dyn UpstreamLogSource>) -> Self {
        Self {
            config: Arc::new(config.normalized()),
            cache,
            upstream,
            lock_value: generate_process_identifier(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn stream_for(self: &Arc<Self>, key: &StreamKey, starting_timestamp: Option<DateTime<Utc>>) -> Arc<LogStream> {
        let mut streams = self.streams.lock();
        if let Some(existing) = streams.get(key) {
            return existing.clone();
        }
        let stream = LogStream::new(
            key.clone(),
            self.config.clone(),
            self.cache.clone(),
            self.upstream.clone(),
            self.lock_value.clone(),
            starting_timestamp,
        );
        streams.insert(key.clone(), stream.clone());
        stream
    }

    /// Attach a subscriber to the (namespace, pod, container) stream,
    /// creating it on first use. `ctx` ending detaches the subscriber
    /// automatically, same as dropping the returned `PodDetach`.
    pub async fn subscribe_pod(
        self: &Arc<Self>,
        namespace: &str,
        pod: &str,
        container: &str,
        tail: i64,
        resume: Resume,
        ctx: CancellationToken,
    ) -> (Subscriber, mpsc::Receiver<ServerEvent>, Vec<LogEntry>, PodDetach) {
        let key = StreamKey::new(namespace, pod, container);
        let starting_timestamp = resume.since_time;
        let stream = self.stream_for(&key, starting_timestamp);
        let (sub, rx, replay) = stream.subscribe(resume, tail).await;
        let detach = PodDetach { hub: self.clone(), key: key.clone(), stream: stream.clone(), subscriber_id: sub.id };

        let hub = self.clone();
        let subscriber_id = sub.id;
        tokio::spawn(async move {
            ctx.cancelled().await;
            hub.detach_pod(&key, &stream, subscriber_id);
        });

        (sub, rx, replay, detach)
    }

    /// Remove a subscriber from its stream and, if that leaves it idle, arm
    /// the idle-TTL eviction timer. Idempotent: safe to call more than once
    /// for the same subscriber (e.g. once from `ctx` cancellation and once
    /// from an explicit or dropped `PodDetach`).
    fn detach_pod(self: &Arc<Self>, key: &StreamKey, stream: &Arc<LogStream>, subscriber_id: u64) {
        stream.unsubscribe(subscriber_id);
        if stream.subscriber_count() == 0 {
            let hub = self.clone();
            let key = key.clone();
            let idle_ttl = hub.config.stream.idle_ttl_seconds;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(idle_ttl)).await;
                hub.evict_if_idle(&key);
            });
        }
    }

    pub fn status(&self, namespace: &str, pod: &str, container: &str) -> Option<StatusSnapshot> {
        let key = StreamKey::new(namespace, pod, container);
        self.streams.lock().get(&key).map(|s| s.status())
    }

    pub fn stats(&self) -> AggregateStats {
        let streams = self.streams.lock();
        let mut stats = AggregateStats { active_streams: streams.len(), ..AggregateStats::default() };
        let now = Utc::now();
        let mut lag_sum: i64 = 0;
        let mut lag_count: i64 = 0;

        for stream in streams.values() {
            let snap = stream.status();
            stats.active_subscribers += snap.subscribers;
            stats.dropped_total += stream.dropped_total();
            stats.buffered_lines_total += snap.buffered_lines;
            stats.buffered_bytes_total += snap.buffered_bytes;
            stats.reconnects_total += snap.reconnects;
            if snap.leader {
                stats.leader_count += 1;
            }
            if snap.last_event_at.is_some() {
                let lag = snap.lag_ms(now);
                stats.lag_ms_max = stats.lag_ms_max.max(lag);
                lag_sum += lag;
                lag_count += 1;
            }
        }
        stats.lag_ms_avg = if lag_count > 0 { lag_sum as f64 / lag_count as f64 } else { 0.0 };
        stats
    }

    /// Removes a stream from the registry and cancels it if, at the moment
    /// of the call, it still has zero subscribers. Called after a detach has
    /// had a chance to settle (the caller arms the idle-TTL timer).
    fn evict_if_idle(&self, key: &StreamKey) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(key) {
            if stream.subscriber_count() == 0 {
                let stream = streams.remove(key).expect("key checked present above");
                stream.shutdown();
            }
        }
    }

    /// Cancel every owned stream and release the shared-cache client.
    pub async fn stop(&self) {
        let streams: Vec<Arc<LogStream>> = self.streams.lock().drain().map(|(_, v)| v).collect();
        for stream in streams {
            stream.shutdown();
        }
        if let Some(cache) = &self.cache {
            cache.close().await;
        }
    }
}

/// Detach handle returned from `subscribe_pod`. Dropping it (explicitly via
/// `detach()`, or implicitly by letting it go out of scope) removes the
/// subscriber and, if the stream becomes idle, arms an idle-TTL timer that
/// evicts the stream from the registry on expiry.
pub struct PodDetach {
    hub: Arc<LogHub>,
    key: StreamKey,
    stream: Arc<LogStream>,
    subscriber_id: u64,
}

impl PodDetach {
    /// Detach now rather than waiting for this handle to drop. Equivalent to
    /// `drop(detach)`.
    pub fn detach(self) {}
}

impl Drop for PodDetach {
    fn drop(&mut self) {
        self.hub.detach_pod(&self.key, &self.stream, self.subscriber_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use logharbor_k8s::log_source::LogLineStream;
    use logharbor_types::StreamConfig;

    struct PendingUpstream;

    #[async_trait]
    impl UpstreamLogSource for PendingUpstream {
        async fn follow(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: Option<&str>,
            _since: Option<DateTime<Utc>>,
            _tail_lines: Option<i64>,
        ) -> anyhow::Result<LogLineStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    fn test_hub(idle_ttl_seconds: u64) -> Arc<LogHub> {
        let config = HubConfig { stream: StreamConfig { idle_ttl_seconds, ..StreamConfig::default() }, ..HubConfig::default() };
        Arc::new(LogHub::new(config, None, Arc::new(PendingUpstream)))
    }

    #[tokio::test]
    async fn subscribe_pod_creates_one_stream_per_key() {
        let hub = test_hub(60);
        let (_s1, _r1, _replay1, _d1) = hub.subscribe_pod("ns", "pod-a", "", 0, Resume::default(), CancellationToken::new()).await;
        let (_s2, _r2, _replay2, _d2) = hub.subscribe_pod("ns", "pod-a", "", 0, Resume::default(), CancellationToken::new()).await;
        let (_s3, _r3, _replay3, _d3) = hub.subscribe_pod("ns", "pod-b", "", 0, Resume::default(), CancellationToken::new()).await;

        let stats = hub.stats();
        assert_eq!(stats.active_streams, 2);
        assert_eq!(stats.active_subscribers, 3);
        hub.stop().await;
    }

    #[tokio::test]
    async fn status_is_none_for_unknown_stream() {
        let hub = test_hub(60);
        assert!(hub.status("ns", "missing", "").is_none());
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_is_evicted_after_ttl_elapses() {
        let hub = test_hub(5);
        let (_sub, _rx, _replay, detach) = hub.subscribe_pod("ns", "pod-a", "", 0, Resume::default(), CancellationToken::new()).await;
        assert_eq!(hub.stats().active_streams, 1);

        detach.detach();
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(hub.stats().active_streams, 0);
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_subscriber_during_idle_window_cancels_eviction() {
        let hub = test_hub(5);
        let (_sub, _rx, _replay, detach) = hub.subscribe_pod("ns", "pod-a", "", 0, Resume::default(), CancellationToken::new()).await;
        detach.detach();

        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        let (_sub2, _rx2, _replay2, _detach2) = hub.subscribe_pod("ns", "pod-a", "", 0, Resume::default(), CancellationToken::new()).await;

        tokio::time::advance(std::time::Duration::from_secs(4)).await;
        tokio::task::yield_now().await;

        assert_eq!(hub.stats().active_streams, 1, "new subscriber arrived before the idle timer fired");
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_ctx_detaches_without_calling_detach_explicitly() {
        let hub = test_hub(5);
        let ctx = CancellationToken::new();
        let (_sub, _rx, _replay, detach) = hub.subscribe_pod("ns", "pod-a", "", 0, Resume::default(), ctx.clone()).await;
        assert_eq!(hub.stats().active_streams, 1);

        ctx.cancel();
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert_eq!(hub.stats().active_streams, 0, "ctx cancellation should detach the subscriber and let idle-TTL evict the stream");
        drop(detach); // already detached via ctx; dropping again is a harmless no-op
        hub.stop().await;
    }

    #[tokio::test]
    async fn dropping_the_handle_without_calling_detach_still_detaches() {
        let hub = test_hub(60);
        let (_sub, _rx, _replay, detach) = hub.subscribe_pod("ns", "pod-a", "", 0, Resume::default(), CancellationToken::new()).await;
        assert_eq!(hub.stats().active_subscribers, 1);

        drop(detach);
        tokio::task::yield_now().await;

        assert_eq!(hub.stats().active_subscribers, 0);
        hub.stop().await;
    }
}
