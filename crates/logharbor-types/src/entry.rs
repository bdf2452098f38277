use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder container name used when a stream targets a pod with no
/// explicit container (single-container pods, mostly).
pub const DEFAULT_CONTAINER: &str = "-";

/// Canonical `(namespace, pod, container)` triple identifying one log stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl StreamKey {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>, container: impl Into<String>) -> Self {
        let container = container.into();
        let container = if container.is_empty() {
            DEFAULT_CONTAINER.to_string()
        } else {
            container
        };
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container,
        }
    }

    /// `"<ns>/<pod>/<container>"`, the key used both in the hub's registry and
    /// as the suffix of the shared-cache stream/lock keys.
    pub fn as_key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Kind of a log entry: an actual log line, or a synthetic marker produced
/// by an app stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Log,
    Marker,
}

/// Subtype of a marker entry. Only meaningful when `kind == Marker`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerKind {
    PodAdded,
    PodRemoved,
    PodRestart,
    PodReady,
    PodNotReady,
    Error,
}

impl MarkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PodAdded => "pod-added",
            Self::PodRemoved => "pod-removed",
            Self::PodRestart => "pod-restart",
            Self::PodReady => "pod-ready",
            Self::PodNotReady => "pod-not-ready",
            Self::Error => "error",
        }
    }
}

/// A single log entry as defined in the data model: either a real log line
/// or a synthetic marker. Identifier and sequence are strictly increasing in
/// the order entries enter a given stream's replay buffer.
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// Monotonic sequence number assigned at ingestion by the leader.
    pub seq: u64,
    /// Opaque identifier: the sequence as text, or a shared-cache stream id.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub pod_name: String,
    pub container_name: String,
    pub message: String,
    pub kind: EntryKind,
    pub marker_kind: Option<MarkerKind>,
}

impl LogEntry {
    pub fn log(seq: u64, timestamp: DateTime<Utc>, pod_name: impl Into<String>, container_name: impl Into<String>, message: impl Into<String>) -> Self {
        let id = seq.to_string();
        Self {
            seq,
            id,
            timestamp,
            pod_name: pod_name.into(),
            container_name: container_name.into(),
            message: message.into(),
            kind: EntryKind::Log,
            marker_kind: None,
        }
    }

    pub fn marker(seq: u64, timestamp: DateTime<Utc>, pod_name: impl Into<String>, marker_kind: MarkerKind, message: impl Into<String>) -> Self {
        let id = seq.to_string();
        Self {
            seq,
            id,
            timestamp,
            pod_name: pod_name.into(),
            container_name: String::new(),
            message: message.into(),
            kind: EntryKind::Marker,
            marker_kind: Some(marker_kind),
        }
    }

    /// Estimated byte size used by the replay buffer's byte bound:
    /// `len(timestamp) + len(message) + len(pod) + len(container) + 16`.
    pub fn estimated_size(&self) -> usize {
        let ts_len = self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true).len();
        ts_len + self.message.len() + self.pod_name.len() + self.container_name.len() + 16
    }
}
