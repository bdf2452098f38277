use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::cache::{CacheError, SharedCache, StreamFields, StreamMessage};

/// Release the lock iff its value still matches ours. A plain `DEL` would
/// happily delete a lock some other replica has since acquired.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Extend the lock's TTL iff its value still matches ours. A plain `PEXPIRE`
/// would extend a lock that another replica has since taken over.
const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Redis-backed implementation of [`SharedCache`]: Redis streams for the
/// cross-replica log fanout, `SET ... NX PX` plus two small Lua scripts for
/// the compare-and-set leader election primitives.
pub struct RedisSharedCache {
    conn: ConnectionManager,
    compare_and_delete: Script,
    compare_and_pexpire: Script,
}

impl RedisSharedCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Backend(e.into()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;
        Ok(Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_pexpire: Script::new(COMPARE_AND_PEXPIRE),
        })
    }

    fn fields_to_kv(fields: &StreamFields) -> Vec<(&'static str, String)> {
        vec![
            ("ts", fields.ts.clone()),
            ("msg", fields.msg.clone()),
            ("pod", fields.pod.clone()),
            ("container", fields.container.clone()),
            ("seq", fields.seq.clone()),
        ]
    }

    fn parse_entry(id: String, map: HashMap<String, String>) -> StreamMessage {
        StreamMessage {
            id,
            fields: StreamFields {
                ts: map.get("ts").cloned().unwrap_or_default(),
                msg: map.get("msg").cloned().unwrap_or_default(),
                pod: map.get("pod").cloned().unwrap_or_default(),
                container: map.get("container").cloned().unwrap_or_default(),
                seq: map.get("seq").cloned().unwrap_or_default(),
            },
        }
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn stream_append(&self, key: &str, fields: StreamFields, max_len: usize) -> Result<String, CacheError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                key,
                redis::streams::StreamMaxlen::Approx(max_len),
                "*",
                &Self::fields_to_kv(&fields),
            )
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;
        Ok(id)
    }

    async fn stream_tail(&self, key: &str, count: usize) -> Result<Vec<StreamMessage>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, HashMap<String, String>)> = conn
            .xrevrange_count(key, "+", "-", count)
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;
        let mut out: Vec<StreamMessage> = raw.into_iter().map(|(id, map)| Self::parse_entry(id, map)).collect();
        out.reverse();
        Ok(out)
    }

    async fn stream_after(&self, key: &str, after_id: &str) -> Result<Vec<StreamMessage>, CacheError> {
        let mut conn = self.conn.clone();
        let lower = format!("({after_id}");
        let raw: Vec<(String, HashMap<String, String>)> = conn
            .xrange(key, &lower, "+")
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;
        Ok(raw.into_iter().map(|(id, map)| Self::parse_entry(id, map)).collect())
    }

    async fn stream_read_blocking(&self, key: &str, after_id: &str, block: Duration) -> Result<Vec<StreamMessage>, CacheError> {
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default().block(block.as_millis() as usize);
        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[key], &[after_id], &opts)
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let map: HashMap<String, String> = id
                    .map
                    .into_iter()
                    .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|v| (k, v)))
                    .collect();
                out.push(Self::parse_entry(id.id, map));
            }
        }
        Ok(out)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;
        Ok(result.is_some())
    }

    async fn compare_and_expire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .compare_and_pexpire
            .key(key)
            .arg(value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;
        Ok(result == 1)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .compare_and_delete
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.into()))?;
        Ok(result == 1)
    }
}
