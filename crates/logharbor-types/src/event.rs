use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{EntryKind, LogEntry};

/// Resume parameters carried by a subscribe request: reattach using a
/// last-seen identifier or timestamp so the server can replay the
/// strictly-later events it still has.
#[derive(Clone, Debug, Default)]
pub struct Resume {
    pub since_id: Option<String>,
    pub since_time: Option<DateTime<Utc>>,
}

impl Resume {
    pub fn is_empty(&self) -> bool {
        self.since_id.is_none() && self.since_time.is_none()
    }
}

/// Options accepted by `subscribe_pod` / the app-stream pool's `subscribe`.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    pub container: String,
    pub tail: i64,
    pub resume: Resume,
}

/// Body of a `log` or `marker` server event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogBody {
    pub id: String,
    pub seq: u64,
    pub timestamp: String,
    pub message: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "containerName")]
    pub container_name: String,
    /// Present only for `marker` events: the marker subtype name, e.g.
    /// `"pod-restart"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl From<&LogEntry> for LogBody {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id.clone(),
            seq: entry.seq,
            timestamp: entry.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            message: entry.message.clone(),
            pod_name: entry.pod_name.clone(),
            container_name: entry.container_name.clone(),
            kind: entry.marker_kind.map(|k| k.as_str().to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsBody {
    pub dropped: u64,
    pub buffered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub timestamp: String,
}

/// Role of a log stream, exposed in `status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Single,
    Leader,
    Follower,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub role: StreamRole,
    pub redis_enabled: bool,
    pub leader: bool,
    pub reconnects: u64,
    pub lag_ms: i64,
    pub last_event_at: String,
    pub subscribers: usize,
    pub buffered_lines: usize,
    pub buffer_bytes: usize,
}

/// One server-to-client event. `log`/`marker` carry an identifier clients
/// should remember for resumption; the others do not.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum ServerEvent {
    Log { id: String, body: LogBody },
    Marker { id: String, body: LogBody },
    Heartbeat { body: HeartbeatBody },
    Stats { body: StatsBody },
    Status { body: StatusBody },
}

impl ServerEvent {
    pub fn from_entry(entry: &LogEntry) -> Self {
        let body = LogBody::from(entry);
        match entry.kind {
            EntryKind::Log => Self::Log { id: entry.id.clone(), body },
            EntryKind::Marker => Self::Marker { id: entry.id.clone(), body },
        }
    }

    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self::Heartbeat {
            body: HeartbeatBody { timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true) },
        }
    }
}

/// Per-stream observability snapshot.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub role: StreamRole,
    pub shared_cache_enabled: bool,
    pub leader: bool,
    pub reconnects: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub subscribers: usize,
    pub buffered_lines: usize,
    pub buffered_bytes: usize,
}

impl StatusSnapshot {
    pub fn lag_ms(&self, now: DateTime<Utc>) -> i64 {
        match self.last_event_at {
            Some(t) => (now - t).num_milliseconds().max(0),
            None => 0,
        }
    }

    pub fn to_body(&self, now: DateTime<Utc>) -> StatusBody {
        StatusBody {
            role: self.role,
            redis_enabled: self.shared_cache_enabled,
            leader: self.leader,
            reconnects: self.reconnects,
            lag_ms: self.lag_ms(now),
            last_event_at: self
                .last_event_at
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
                .unwrap_or_default(),
            subscribers: self.subscribers,
            buffered_lines: self.buffered_lines,
            buffer_bytes: self.buffered_bytes,
        }
    }
}

/// Hub-wide aggregate statistics, as returned by `LogHub::stats`.
#[derive(Clone, Debug, Default)]
pub struct AggregateStats {
    pub active_streams: usize,
    pub active_subscribers: usize,
    pub dropped_total: u64,
    pub buffered_lines_total: usize,
    pub buffered_bytes_total: usize,
    pub leader_count: usize,
    pub reconnects_total: u64,
    pub lag_ms_max: i64,
    pub lag_ms_avg: f64,
}
