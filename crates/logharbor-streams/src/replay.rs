use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use logharbor_types::LogEntry;
use parking_lot::RwLock;

/// Bounded, ordered window of recent log entries for one log stream.
/// `append` takes the write lock; every query takes the read lock. Modeled on
/// `kubescope-logs::buffer::LogBuffer`, which uses the same `VecDeque` behind
/// a `parking_lot::RwLock` and the same oldest-first eviction, generalized
/// with the `since_id`/`since_time` queries a resumable subscriber protocol
/// needs.
pub struct ReplayBuffer {
    max_entries: usize,
    max_bytes: usize,
    entries: RwLock<VecDeque<LogEntry>>,
    bytes: RwLock<usize>,
}

impl ReplayBuffer {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
            entries: RwLock::new(VecDeque::new()),
            bytes: RwLock::new(0),
        }
    }

    /// Insert at the end, then evict from the front until both bounds hold.
    pub fn append(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        let mut bytes = self.bytes.write();

        *bytes += entry.estimated_size();
        entries.push_back(entry);

        while entries.len() > self.max_entries || *bytes > self.max_bytes {
            if let Some(removed) = entries.pop_front() {
                *bytes = bytes.saturating_sub(removed.estimated_size());
            } else {
                break;
            }
        }
    }

    /// `(count, byte_estimate)` without cloning any entry.
    pub fn snapshot(&self) -> (usize, usize) {
        (self.entries.read().len(), *self.bytes.read())
    }

    /// Last `n` entries, in order. All entries if `n <= 0` or `n >= count`.
    pub fn tail(&self, n: i64) -> Vec<LogEntry> {
        let entries = self.entries.read();
        if n <= 0 || n as usize >= entries.len() {
            return entries.iter().cloned().collect();
        }
        let start = entries.len() - n as usize;
        entries.iter().skip(start).cloned().collect()
    }

    /// All entries strictly after `id`, plus whether `id` was still present.
    pub fn since_id(&self, id: &str) -> (Vec<LogEntry>, bool) {
        let entries = self.entries.read();
        match entries.iter().position(|e| e.id == id) {
            Some(idx) => (entries.iter().skip(idx + 1).cloned().collect(), true),
            None => (Vec::new(), false),
        }
    }

    /// All entries with timestamp >= `t`, in order. Entries with an
    /// unparseable timestamp can't occur in this representation (the
    /// timestamp field is already a parsed `DateTime`); lines with an
    /// unparseable timestamp are skipped upstream, at ingestion time in
    /// the parser.
    pub fn since_time(&self, t: DateTime<Utc>) -> Vec<LogEntry> {
        self.entries.read().iter().filter(|e| e.timestamp >= t).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logharbor_types::LogEntry;

    fn entry(seq: u64, msg: &str) -> LogEntry {
        LogEntry::log(seq, Utc::now(), "p", "c", msg)
    }

    #[test]
    fn tail_returns_last_n_after_eviction() {
        let buf = ReplayBuffer::new(5, usize::MAX);
        for i in 1..=7u64 {
            buf.append(entry(i, "x"));
        }
        let tail = buf.tail(3);
        assert_eq!(tail.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["5", "6", "7"]);
        assert_eq!(buf.snapshot().0, 5);
    }

    #[test]
    fn since_id_resume_returns_strictly_later_entries() {
        let buf = ReplayBuffer::new(100, usize::MAX);
        for i in 10..=15u64 {
            buf.append(entry(i, "x"));
        }
        let (entries, found) = buf.since_id("12");
        assert!(found);
        assert_eq!(entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["13", "14", "15"]);
    }

    #[test]
    fn since_id_not_found_reports_false() {
        let buf = ReplayBuffer::new(100, usize::MAX);
        buf.append(entry(1, "x"));
        let (entries, found) = buf.since_id("999");
        assert!(!found);
        assert!(entries.is_empty());
    }

    #[test]
    fn byte_eviction_keeps_bytes_under_bound() {
        // timestamp length 20, message "xxxxxxxxxx" (10), pod "p" (1),
        // container "c" (1) => 20+10+1+1+16 = 48 bytes/entry.
        let ts: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let buf = ReplayBuffer::new(10_000, 200);
        for i in 1..=10u64 {
            buf.append(LogEntry::log(i, ts, "p", "c", "xxxxxxxxxx"));
        }
        let (count, bytes) = buf.snapshot();
        assert!(bytes <= 200, "bytes {bytes} exceeded bound");
        // 200 / 48 = 4.16, so at most 4 entries fit.
        assert_eq!(count, 4);
        let tail = buf.tail(-1);
        assert_eq!(tail.first().unwrap().id, "7");
        assert_eq!(tail.last().unwrap().id, "10");
    }

    #[test]
    fn since_time_filters_and_orders() {
        let base = Utc::now();
        let buf = ReplayBuffer::new(100, usize::MAX);
        buf.append(LogEntry::log(1, base - chrono::Duration::seconds(10), "p", "c", "old"));
        buf.append(LogEntry::log(2, base, "p", "c", "at"));
        buf.append(LogEntry::log(3, base + chrono::Duration::seconds(10), "p", "c", "new"));
        let result = buf.since_time(base);
        assert_eq!(result.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(), vec!["at", "new"]);
    }
}
