use serde::{Deserialize, Serialize};

/// Replace a zero-or-negative config value with `default`.
fn normalize(value: i64, default: i64) -> i64 {
    if value <= 0 { default } else { value }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 50 * 1024 * 1024,
        }
    }
}

impl BufferConfig {
    pub fn normalized(self) -> Self {
        let d = Self::default();
        Self {
            max_entries: normalize(self.max_entries as i64, d.max_entries as i64) as usize,
            max_bytes: normalize(self.max_bytes as i64, d.max_bytes as i64) as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub buffer_lines: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self { buffer_lines: 2000 }
    }
}

impl SubscriberConfig {
    pub fn normalized(self) -> Self {
        Self {
            buffer_lines: normalize(self.buffer_lines as i64, Self::default().buffer_lines as i64) as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub idle_ttl_seconds: u64,
    pub max_line_length: usize,
    pub default_tail_lines: i64,
    pub max_tail_lines: i64,
    pub app_resync_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_ttl_seconds: 60,
            max_line_length: 10_000,
            default_tail_lines: 10_000,
            max_tail_lines: 10_000,
            app_resync_seconds: 10,
        }
    }
}

impl StreamConfig {
    pub fn normalized(self) -> Self {
        let d = Self::default();
        let max_tail_lines = normalize(self.max_tail_lines, d.max_tail_lines);
        // Clamp rather than reject out-of-range configuration.
        let default_tail_lines = normalize(self.default_tail_lines, d.default_tail_lines).min(max_tail_lines);
        Self {
            idle_ttl_seconds: normalize(self.idle_ttl_seconds as i64, d.idle_ttl_seconds as i64) as u64,
            max_line_length: normalize(self.max_line_length as i64, d.max_line_length as i64) as usize,
            default_tail_lines,
            max_tail_lines,
            app_resync_seconds: normalize(self.app_resync_seconds as i64, d.app_resync_seconds as i64) as u64,
        }
    }

    /// Clamp a caller-supplied tail request into `[1, max_tail_lines]`,
    /// falling back to `default_tail_lines` when absent.
    pub fn clamp_tail(&self, requested: Option<i64>) -> i64 {
        requested.unwrap_or(self.default_tail_lines).clamp(1, self.max_tail_lines)
    }

    pub fn truncation_suffix(&self) -> &'static str {
        " ...[truncated]"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedCacheConfig {
    pub enabled: bool,
    pub prefix: String,
    pub max_len: usize,
    pub block_millis: u64,
    pub lock_ttl_seconds: u64,
    pub cluster_name: String,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: "logharbor:logs".to_string(),
            max_len: 10_000,
            block_millis: 2_000,
            lock_ttl_seconds: 15,
            cluster_name: "cluster".to_string(),
        }
    }
}

impl SharedCacheConfig {
    pub fn normalized(self) -> Self {
        let d = Self::default();
        Self {
            enabled: self.enabled,
            prefix: if self.prefix.is_empty() { d.prefix } else { self.prefix },
            max_len: normalize(self.max_len as i64, d.max_len as i64) as usize,
            block_millis: normalize(self.block_millis as i64, d.block_millis as i64) as u64,
            lock_ttl_seconds: normalize(self.lock_ttl_seconds as i64, d.lock_ttl_seconds as i64) as u64,
            cluster_name: if self.cluster_name.is_empty() { d.cluster_name } else { self.cluster_name },
        }
    }

    /// Interval at which a log stream checks/refreshes its lock:
    /// `max(lock_ttl / 2, 2 seconds)`.
    pub fn lock_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs((self.lock_ttl_seconds / 2).max(2))
    }

    pub fn lock_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn block_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.block_millis)
    }
}

/// Aggregate configuration consumed by the log hub (and, transitively, every
/// log stream and app stream it creates).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub buffer: BufferConfig,
    pub subscriber: SubscriberConfig,
    pub stream: StreamConfig,
    pub shared_cache: SharedCacheConfig,
}

impl HubConfig {
    pub fn normalized(self) -> Self {
        Self {
            buffer: self.buffer.normalized(),
            subscriber: self.subscriber.normalized(),
            stream: self.stream.normalized(),
            shared_cache: self.shared_cache.normalized(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_negative_values_fall_back_to_defaults() {
        let cfg = HubConfig {
            buffer: BufferConfig { max_entries: 0, max_bytes: -1i64 as usize },
            stream: StreamConfig { idle_ttl_seconds: 0, ..StreamConfig::default() },
            ..HubConfig::default()
        }
        .normalized();
        assert_eq!(cfg.buffer.max_entries, BufferConfig::default().max_entries);
        assert_eq!(cfg.stream.idle_ttl_seconds, StreamConfig::default().idle_ttl_seconds);
    }

    #[test]
    fn max_tail_smaller_than_default_clamps_default() {
        let cfg = StreamConfig {
            default_tail_lines: 50_000,
            max_tail_lines: 500,
            ..StreamConfig::default()
        }
        .normalized();
        assert_eq!(cfg.default_tail_lines, 500);
    }

    #[test]
    fn clamp_tail_respects_bounds() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.clamp_tail(None), cfg.default_tail_lines);
        assert_eq!(cfg.clamp_tail(Some(-5)), 1);
        assert_eq!(cfg.clamp_tail(Some(i64::MAX)), cfg.max_tail_lines);
    }
}
