use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use logharbor_cache::{SharedCache, StreamFields, StreamMessage};
use logharbor_k8s::UpstreamLogSource;
use logharbor_types::{HubConfig, LogEntry, Resume, ServerEvent, StatsBody, StatusSnapshot, StreamKey, StreamRole};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lock::StreamLock;
use crate::parser::{parse_line, truncate_message};
use crate::replay::ReplayBuffer;
use crate::subscriber::{broadcast, new_subscriber, Subscriber};

/// A running leader- or follower-side task, cancellable independently of the
/// stream's own lifetime. A role transition cancels and drops the old one.
struct RoleTask {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl RoleTask {
    fn stop(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

struct Inner {
    subscribers: std::collections::HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    last_cache_id: String,
    role_task: Option<RoleTask>,
}

/// One `(namespace, pod, container)` log stream: owns a replay buffer, runs
/// either as leader (follows the upstream source) or follower (reads the
/// shared-cache stream), and fans out to subscribers. Modeled on
/// `kubescope-logs::stream::LogStreamManager`, generalized from "always
/// follow upstream" to a leader/follower state machine.
pub struct LogStream {
    key: StreamKey,
    config: Arc<HubConfig>,
    cache: Option<Arc<dyn SharedCache>>,
    upstream: Arc<dyn UpstreamLogSource>,
    lock_value: Arc<str>,
    starting_timestamp: Option<DateTime<Utc>>,
    buffer: ReplayBuffer,
    inner: Mutex<Inner>,
    role: Mutex<StreamRole>,
    next_seq: AtomicU64,
    reconnects: AtomicU64,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    subscriber_count: AtomicUsize,
    root_token: CancellationToken,
    started: std::sync::atomic::AtomicBool,
}

impl LogStream {
    pub fn new(
        key: StreamKey,
        config: Arc<HubConfig>,
        cache: Option<Arc<dyn SharedCache>>,
        upstream: Arc<dyn UpstreamLogSource>,
        lock_value: Arc<str>,
        starting_timestamp: Option<DateTime<Utc>>,
    ) -> Arc<Self> {
        let initial_role = if cache.is_some() { StreamRole::Follower } else { StreamRole::Single };
        Arc::new(Self {
            buffer: ReplayBuffer::new(config.buffer.max_entries, config.buffer.max_bytes),
            key,
            config,
            cache,
            upstream,
            lock_value,
            starting_timestamp,
            inner: Mutex::new(Inner {
                subscribers: std::collections::HashMap::new(),
                next_subscriber_id: 1,
                last_cache_id: "0-0".to_string(),
                role_task: None,
            }),
            role: Mutex::new(initial_role),
            next_seq: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_event_at: Mutex::new(None),
            subscriber_count: AtomicUsize::new(0),
            root_token: CancellationToken::new(),
            started: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.config.shared_cache.prefix, self.config.shared_cache.cluster_name, self.key.as_key())
    }

    fn lock_key(&self) -> String {
        format!("{}:lock", self.cache_key())
    }

    fn role(&self) -> StreamRole {
        *self.role.lock()
    }

    fn set_role(&self, role: StreamRole) {
        *self.role.lock() = role;
    }

    fn set_last_event_at(&self, ts: DateTime<Utc>) {
        *self.last_event_at.lock() = Some(ts);
    }

    /// Start the stream's background loops on first subscribe. Idempotent.
    pub fn ensure_started(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
        let this = self.clone();
        let token = self.root_token.child_token();
        tokio::spawn(async move { this.run_telemetry(token).await });
    }

    /// Heartbeat, statistics, and status events run on their own cadence,
    /// independent of the leader/follower role loop.
    async fn run_telemetry(self: Arc<Self>, token: CancellationToken) {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(15));
        heartbeat.tick().await;
        let mut stats_tick = tokio::time::interval(Duration::from_secs(5));
        stats_tick.tick().await;
        let mut status_tick = tokio::time::interval(Duration::from_secs(self.config.stream.app_resync_seconds.max(1)));
        status_tick.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = heartbeat.tick() => {
                    self.broadcast_event(&ServerEvent::heartbeat(Utc::now()));
                }
                _ = stats_tick.tick() => {
                    self.emit_stats();
                }
                _ = status_tick.tick() => {
                    self.emit_status();
                }
            }
        }
    }

    /// Each subscriber gets its own dropped count and channel depth, not a
    /// stream-wide aggregate: a slow subscriber's drops must not appear in a
    /// fast subscriber's stats.
    fn emit_stats(&self) {
        let subs: Vec<Subscriber> = self.inner.lock().subscribers.values().cloned().collect();
        for sub in subs {
            let body = StatsBody { dropped: sub.dropped_count(), buffered: sub.channel_depth(), sources: None };
            sub.try_send(ServerEvent::Stats { body });
        }
    }

    fn emit_status(&self) {
        let body = self.status().to_body(Utc::now());
        self.broadcast_event(&ServerEvent::Status { body });
    }

    async fn run(self: Arc<Self>) {
        if self.cache.is_none() {
            self.set_role(StreamRole::Single);
            self.run_upstream_follower(self.root_token.child_token()).await;
            return;
        }

        let lock = StreamLock::new(
            self.cache.clone().expect("cache present"),
            self.lock_key(),
            self.lock_value.to_string(),
            self.config.shared_cache.lock_ttl(),
        );

        if lock.try_acquire().await {
            self.become_leader();
        } else {
            self.become_follower();
        }

        let mut ticker = tokio::time::interval(self.config.shared_cache.lock_check_interval());
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = self.root_token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.role() {
                        StreamRole::Leader => {
                            if !lock.try_extend().await {
                                tracing::debug!(key = %self.key, "lost leadership, demoting to follower");
                                self.become_follower();
                            }
                        }
                        StreamRole::Follower => {
                            if lock.try_acquire().await {
                                tracing::debug!(key = %self.key, "acquired lock, promoting to leader");
                                self.become_leader();
                            }
                        }
                        StreamRole::Single => unreachable!("single role only occurs without a shared cache"),
                    }
                }
            }
        }

        let task = self.inner.lock().role_task.take();
        if let Some(task) = task {
            task.stop();
        }
        if self.role() == StreamRole::Leader {
            lock.release().await;
        }
    }

    fn become_leader(self: &Arc<Self>) {
        let old = self.inner.lock().role_task.take();
        if let Some(old) = old {
            old.stop();
        }
        self.set_role(StreamRole::Leader);
        let token = self.root_token.child_token();
        let this = self.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move { this.run_upstream_follower(child).await });
        self.inner.lock().role_task = Some(RoleTask { token, handle });
    }

    fn become_follower(self: &Arc<Self>) {
        let old = self.inner.lock().role_task.take();
        if let Some(old) = old {
            old.stop();
        }
        self.set_role(StreamRole::Follower);
        let token = self.root_token.child_token();
        let this = self.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move { this.run_cache_consumer(child).await });
        self.inner.lock().role_task = Some(RoleTask { token, handle });
    }

    async fn run_upstream_follower(self: Arc<Self>, token: CancellationToken) {
        let mut first_connect = true;
        let mut backoff = Duration::from_secs(1);

        loop {
            if token.is_cancelled() {
                return;
            }

            let since_time = if first_connect { self.starting_timestamp } else { None };
            let configured_tail = (self.config.buffer.max_entries as i64).min(self.config.stream.max_tail_lines);
            let tail_lines = if configured_tail > 0 { Some(configured_tail) } else { None };
            let container = if self.key.container == logharbor_types::DEFAULT_CONTAINER { None } else { Some(self.key.container.as_str()) };

            match self.upstream.follow(&self.key.namespace, &self.key.pod, container, since_time, tail_lines).await {
                Ok(mut lines) => {
                    backoff = Duration::from_secs(1);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            next = lines.next() => {
                                match next {
                                    Some(Ok(line)) => self.ingest_upstream_line(&line).await,
                                    Some(Err(e)) => {
                                        tracing::debug!(key = %self.key, error = %e, "upstream log read error");
                                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                                        break;
                                    }
                                    None => {
                                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(key = %self.key, error = %e, "failed to open upstream log stream");
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                }
            }

            first_connect = false;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn ingest_upstream_line(&self, line: &str) {
        let (ts, message) = parse_line(line);
        let message = truncate_message(&message, self.config.stream.max_line_length, self.config.stream.truncation_suffix());
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = LogEntry::log(seq, ts, self.key.pod.clone(), self.key.container.clone(), message.clone());

        if let Some(cache) = &self.cache {
            let fields = StreamFields {
                ts: ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                msg: message,
                pod: self.key.pod.clone(),
                container: self.key.container.clone(),
                seq: seq.to_string(),
            };
            match cache.stream_append(&self.cache_key(), fields, self.config.shared_cache.max_len).await {
                Ok(id) => entry.id = id,
                Err(e) => tracing::warn!(key = %self.key, error = %e, "shared cache append failed, keeping in-memory id"),
            }
        }

        self.set_last_event_at(ts);
        self.buffer.append(entry.clone());
        self.broadcast_entry(&entry);
    }

    async fn run_cache_consumer(self: Arc<Self>, token: CancellationToken) {
        let cache = match &self.cache {
            Some(c) => c.clone(),
            None => return,
        };

        match cache.stream_tail(&self.cache_key(), self.config.buffer.max_entries).await {
            Ok(messages) => {
                let mut cursor = "0-0".to_string();
                for msg in messages {
                    cursor = msg.id.clone();
                    if let Some(entry) = self.message_to_entry(msg) {
                        self.buffer.append(entry);
                    }
                }
                self.inner.lock().last_cache_id = cursor;
            }
            Err(e) => tracing::warn!(key = %self.key, error = %e, "shared cache prefill failed"),
        }

        loop {
            if token.is_cancelled() {
                return;
            }
            let cursor = self.inner.lock().last_cache_id.clone();
            match cache.stream_read_blocking(&self.cache_key(), &cursor, self.config.shared_cache.block_duration()).await {
                Ok(messages) => {
                    for msg in messages {
                        let new_cursor = msg.id.clone();
                        if let Some(entry) = self.message_to_entry(msg) {
                            self.set_last_event_at(entry.timestamp);
                            self.buffer.append(entry.clone());
                            self.broadcast_entry(&entry);
                        }
                        self.inner.lock().last_cache_id = new_cursor;
                    }
                }
                Err(e) => {
                    tracing::debug!(key = %self.key, error = %e, "shared cache read failed");
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    fn message_to_entry(&self, msg: StreamMessage) -> Option<LogEntry> {
        if msg.fields.msg.is_empty() {
            return None;
        }
        let timestamp = DateTime::parse_from_rfc3339(&msg.fields.ts).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now());
        let seq = msg.fields.seq.parse().unwrap_or(0);
        let pod_name = if msg.fields.pod.is_empty() { self.key.pod.clone() } else { msg.fields.pod };
        let container_name = if msg.fields.container.is_empty() { self.key.container.clone() } else { msg.fields.container };
        Some(LogEntry {
            seq,
            id: msg.id,
            timestamp,
            pod_name,
            container_name,
            message: msg.fields.msg,
            kind: logharbor_types::EntryKind::Log,
            marker_kind: None,
        })
    }

    fn broadcast_event(&self, event: &ServerEvent) {
        let subs: Vec<Subscriber> = self.inner.lock().subscribers.values().cloned().collect();
        broadcast(&subs, event);
    }

    fn broadcast_entry(&self, entry: &LogEntry) {
        self.broadcast_event(&ServerEvent::from_entry(entry));
    }

    fn looks_like_cache_id(id: &str) -> bool {
        match id.split_once('-') {
            Some((a, b)) => !a.is_empty() && !b.is_empty() && a.bytes().all(|c| c.is_ascii_digit()) && b.bytes().all(|c| c.is_ascii_digit()),
            None => false,
        }
    }

    async fn compute_replay(&self, resume: &Resume, tail: i64) -> Vec<LogEntry> {
        if let Some(since_id) = &resume.since_id {
            let (entries, found) = self.buffer.since_id(since_id);
            if found {
                return entries;
            }
            if Self::looks_like_cache_id(since_id) {
                if let Some(cache) = &self.cache {
                    match cache.stream_after(&self.cache_key(), since_id).await {
                        Ok(messages) => return messages.into_iter().filter_map(|m| self.message_to_entry(m)).collect(),
                        Err(e) => tracing::debug!(key = %self.key, error = %e, "shared cache since_id fetch failed"),
                    }
                }
            }
        }

        if let Some(since_time) = resume.since_time {
            let entries = self.buffer.since_time(since_time);
            if !entries.is_empty() {
                return entries;
            }
            if let Some(cache) = &self.cache {
                let id = format!("{}-0", since_time.timestamp_millis());
                match cache.stream_after(&self.cache_key(), &id).await {
                    Ok(messages) => return messages.into_iter().filter_map(|m| self.message_to_entry(m)).collect(),
                    Err(e) => tracing::debug!(key = %self.key, error = %e, "shared cache since_time fetch failed"),
                }
            }
            return Vec::new();
        }

        if tail > 0 {
            let entries = self.buffer.tail(tail);
            if !entries.is_empty() {
                return entries;
            }
            if let Some(cache) = &self.cache {
                match cache.stream_tail(&self.cache_key(), tail as usize).await {
                    Ok(messages) => return messages.into_iter().filter_map(|m| self.message_to_entry(m)).collect(),
                    Err(e) => tracing::debug!(key = %self.key, error = %e, "shared cache tail fetch failed"),
                }
            }
            return entries;
        }

        Vec::new()
    }

    /// Attach a subscriber; starts the stream on first use. Returns the
    /// subscriber, its receiving half, and the replay entries to deliver
    /// before any live event.
    pub async fn subscribe(self: &Arc<Self>, resume: Resume, tail: i64) -> (Subscriber, mpsc::Receiver<ServerEvent>, Vec<LogEntry>) {
        self.ensure_started();
        let replay = self.compute_replay(&resume, tail).await;

        let mut inner = self.inner.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let (sub, rx) = new_subscriber(id, self.config.subscriber.buffer_lines);
        inner.subscribers.insert(id, sub.clone());
        drop(inner);
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);

        (sub, rx, replay)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.inner.lock().subscribers.remove(&id).is_some() {
            self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Sum of every current subscriber's dropped-event counter.
    pub fn dropped_total(&self) -> u64 {
        self.inner.lock().subscribers.values().map(|s| s.dropped_count()).sum()
    }

    pub fn shutdown(&self) {
        self.root_token.cancel();
    }

    pub fn status(&self) -> StatusSnapshot {
        let (buffered_lines, buffered_bytes) = self.buffer.snapshot();
        let role = self.role();
        StatusSnapshot {
            role,
            shared_cache_enabled: self.cache.is_some(),
            leader: role != StreamRole::Follower,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_event_at: *self.last_event_at.lock(),
            subscribers: self.subscriber_count(),
            buffered_lines,
            buffered_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use logharbor_cache::InMemorySharedCache;
    use logharbor_k8s::log_source::LogLineStream;

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

    fn test_stream(cache: Option<Arc<dyn SharedCache>>) -> Arc<LogStream> {
        let key = StreamKey::new("ns", "pod-a", "");
        LogStream::new(key, Arc::new(HubConfig::default()), cache, Arc::new(PendingUpstream), Arc::from("node-1"), None)
    }

    #[test]
    fn looks_like_cache_id_accepts_only_dash_separated_digits() {
        assert!(LogStream::looks_like_cache_id("1700000000000-3"));
        assert!(!LogStream::looks_like_cache_id("42"));
        assert!(!LogStream::looks_like_cache_id("abc-def"));
        assert!(!LogStream::looks_like_cache_id("1700000000000-"));
    }

    #[tokio::test]
    async fn compute_replay_tail_reads_from_buffer_first() {
        let stream = test_stream(None);
        stream.buffer.append(LogEntry::log(1, Utc::now(), "pod-a", "-", "one"));
        stream.buffer.append(LogEntry::log(2, Utc::now(), "pod-a", "-", "two"));

        let replay = stream.compute_replay(&Resume::default(), 1).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].message, "two");
    }

    #[tokio::test]
    async fn compute_replay_since_id_found_in_buffer_returns_only_later_entries() {
        let stream = test_stream(None);
        let e1 = LogEntry::log(1, Utc::now(), "pod-a", "-", "one");
        let since_id = e1.id.clone();
        stream.buffer.append(e1);
        stream.buffer.append(LogEntry::log(2, Utc::now(), "pod-a", "-", "two"));

        let resume = Resume { since_id: Some(since_id), since_time: None };
        let replay = stream.compute_replay(&resume, 0).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].message, "two");
    }

    #[tokio::test]
    async fn compute_replay_since_id_falls_through_to_cache_when_not_buffered() {
        let cache: Arc<dyn SharedCache> = Arc::new(InMemorySharedCache::new());
        let stream = test_stream(Some(cache.clone()));
        let id = cache
            .stream_append(
                &stream.cache_key(),
                StreamFields { ts: Utc::now().to_rfc3339(), msg: "cached".into(), pod: "pod-a".into(), container: "-".into(), seq: "1".into() },
                100,
            )
            .await
            .unwrap();

        let resume = Resume { since_id: Some(id), since_time: None };
        let replay = stream.compute_replay(&resume, 0).await;
        assert!(replay.is_empty(), "nothing appended after the cursor itself");
    }

    #[tokio::test]
    async fn compute_replay_unmatched_non_cache_id_falls_through_to_tail() {
        let stream = test_stream(None);
        stream.buffer.append(LogEntry::log(1, Utc::now(), "pod-a", "-", "one"));

        let resume = Resume { since_id: Some("not-a-cache-id-and-not-buffered".to_string()), since_time: None };
        let replay = stream.compute_replay(&resume, 5).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].message, "one");
    }

    #[tokio::test]
    async fn compute_replay_with_no_resume_and_non_positive_tail_is_empty() {
        let stream = test_stream(None);
        stream.buffer.append(LogEntry::log(1, Utc::now(), "pod-a", "-", "one"));

        let replay = stream.compute_replay(&Resume::default(), 0).await;
        assert!(replay.is_empty());
    }

    #[test]
    fn status_reports_single_role_without_cache() {
        let stream = test_stream(None);
        let status = stream.status();
        assert_eq!(status.role, StreamRole::Single);
        assert!(!status.shared_cache_enabled);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_tracks_subscriber_count() {
        let stream = test_stream(None);
        let (sub, _rx, _replay) = stream.subscribe(Resume::default(), 0).await;
        assert_eq!(stream.subscriber_count(), 1);
        stream.unsubscribe(sub.id);
        assert_eq!(stream.subscriber_count(), 0);
        stream.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_loop_emits_heartbeat_stats_and_status_on_their_own_cadence() {
        let stream = test_stream(None);
        let (_sub, mut rx, _replay) = stream.subscribe(Resume::default(), 0).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Stats { .. })), "expected a stats event by the 5s mark");

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        let (mut saw_status, mut saw_heartbeat, mut saw_stats) = (false, false, false);
        while let Ok(event) = rx.try_recv() {
            match event {
                ServerEvent::Status { .. } => saw_status = true,
                ServerEvent::Heartbeat { .. } => saw_heartbeat = true,
                ServerEvent::Stats { .. } => saw_stats = true,
                _ => {}
            }
        }
        assert!(saw_status, "expected a status event by the 10s mark");
        assert!(saw_heartbeat, "expected a heartbeat by the 15s mark");
        assert!(saw_stats, "expected another stats event by the 15s mark");

        stream.shutdown();
    }
}
