use chrono::{DateTime, Utc};

/// Parse a raw upstream log line into `(timestamp, message)`. Attempts an
/// RFC3339-nano (falling back to RFC3339) timestamp prefix terminated by the
/// first space; on failure, uses now() and the full line as the message.
///
/// Grounded on `kubescope-logs::parser::LogParser::extract_k8s_timestamp`,
/// including its UTF-8 char-boundary-safe scan for the terminator — dropped
/// here is the JSON/log-level detection half, which this spec's data model
/// has no use for.
pub fn parse_line(raw: &str) -> (DateTime<Utc>, String) {
    if let Some(space_idx) = find_timestamp_terminator(raw) {
        let ts_str = &raw[..space_idx];
        if let Ok(ts) = DateTime::parse_from_rfc3339(ts_str) {
            let remainder = raw[space_idx..].trim_start();
            return (ts.with_timezone(&Utc), remainder.to_string());
        }
    }
    (Utc::now(), raw.to_string())
}

/// Find the first space within the timestamp-length prefix of `raw`
/// (RFC3339-nano timestamps run up to ~35 bytes), respecting UTF-8 char
/// boundaries so a multibyte character near the boundary can't panic a slice.
fn find_timestamp_terminator(raw: &str) -> Option<usize> {
    let search_end = floor_char_boundary(raw, 35.min(raw.len()));
    raw.get(..search_end).and_then(|s| s.find(' '))
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Truncate `message` to `max_len` bytes (on a char boundary), appending
/// `suffix` iff truncation occurred.
pub fn truncate_message(message: &str, max_len: usize, suffix: &str) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let cut = floor_char_boundary(message, max_len);
    format!("{}{}", &message[..cut], suffix)
}
