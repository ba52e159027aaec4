//! Key-Value Store Interface
//!
//! The thin capability the monitor consumes: scalars with integer
//! increment, unordered sets, bounded lists, hashes and pattern scans.
//! Values are strings; all serialization happens in the callers.
//!
//! Two backends are provided. [`RedisKv`] wraps a Redis connection with
//! bounded retry and exponential backoff, and batches the list push+trim
//! pair through a pipeline. [`MemoryKv`] implements the same contract over
//! in-process maps for tests and for degraded operation while the real
//! store is unreachable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors surfaced by the store backends
#[derive(Debug, Error)]
pub enum KvError {
    /// The store cannot be reached; retries exhausted
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    /// A single operation failed (wrong type, protocol error)
    #[error("kv operation failed: {0}")]
    Operation(String),
}

/// Store operations the monitor and API depend on
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Integer increment, creating the key at 1
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set add; returns true when the member was newly added
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// List left-push; returns the new length
    async fn lpush(&self, key: &str, value: &str) -> Result<i64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<i64>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Left-push then trim to `max_len`, batched where the backend allows
    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<()> {
        self.lpush(key, value).await?;
        self.ltrim(key, 0, max_len as i64 - 1).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Glob-style key scan
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Glob matching for `scan_keys`: `*` wildcards only, which is all the
/// monitor's key layout needs.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !key.starts_with(first) {
        return false;
    }

    let mut pos = first.len();
    let mut rest: Vec<&str> = parts.collect();
    let last = if pattern.ends_with('*') {
        None
    } else {
        rest.pop()
    };

    for part in rest {
        if part.is_empty() {
            continue;
        }
        match key[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }

    match last {
        Some(suffix) => key.len() >= pos + suffix.len() && key.ends_with(suffix),
        None => true,
    }
}

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

/// In-memory store backend
#[derive(Debug, Default)]
pub struct MemoryKv {
    state: Mutex<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wrong_type(key: &str) -> KvError {
    KvError::Operation(format!("wrong value type for key {}", key))
}

/// Normalize redis-style start/stop range indices against a length
fn resolve_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start >= len || stop < start {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        match state.get(key) {
            Some(Value::Scalar(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(key.to_string(), Value::Scalar(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.contains_key(key))
    }

    async fn ttl(&self, _key: &str) -> Result<i64> {
        // the in-memory backend never expires keys
        Ok(-1)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(key.to_string())
            .or_insert_with(|| Value::Scalar("0".to_string()));
        match entry {
            Value::Scalar(value) => {
                let current: i64 = value
                    .parse()
                    .map_err(|_| KvError::Operation(format!("non-integer value at {}", key)))?;
                let next = current + 1;
                *value = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()));
        match entry {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.get_mut(key) {
            Some(Value::Set(set)) => Ok(set.remove(member)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        match state.get(key) {
            Some(Value::Set(set)) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                list.push_front(value.to_string());
                Ok(list.len() as i64)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        match state.get(key) {
            Some(Value::List(list)) => match resolve_range(start, stop, list.len()) {
                Some((start, stop)) => Ok(list.range(start..=stop).cloned().collect()),
                None => Ok(Vec::new()),
            },
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let state = self.state.lock().await;
        match state.get(key) {
            Some(Value::List(list)) => Ok(list.len() as i64),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.get_mut(key) {
            Some(Value::List(list)) => {
                match resolve_range(start, stop, list.len()) {
                    Some((start, stop)) => {
                        let kept: VecDeque<String> =
                            list.range(start..=stop).cloned().collect();
                        *list = kept;
                    }
                    None => list.clear(),
                }
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(()),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        match state.get(key) {
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let state = self.state.lock().await;
        match state.get(key) {
            Some(Value::Hash(hash)) => {
                let mut pairs: Vec<(String, String)> = hash
                    .iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();
                pairs.sort();
                Ok(pairs)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.get_mut(key) {
            Some(Value::Hash(hash)) => Ok(hash.remove(field).is_some()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .keys()
            .filter(|key| pattern_matches(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Retry policy for the Redis backend
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts beyond the first
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Redis-backed store
pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
    retry: RetryPolicy,
}

impl RedisKv {
    /// Connect to the given redis URL (`redis://[:password@]host:port/db`)
    pub async fn connect(url: &str, retry: RetryPolicy) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        Ok(RedisKv { manager, retry })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut attempt = 0;
        loop {
            let mut conn = self.manager.clone();
            let outcome: std::result::Result<T, redis::RedisError> =
                cmd.query_async(&mut conn).await;
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_io_error() && attempt < self.retry.max_retries => {
                    let delay = self.retry.base_delay * 2u32.pow(attempt);
                    tracing::warn!(attempt, error = %err, "kv operation failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_io_error() => {
                    return Err(KvError::Unavailable(err.to_string()))
                }
                Err(err) => return Err(KvError::Operation(err.to_string())),
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ping(&self) -> Result<()> {
        self.query::<String>(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.query::<()>(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let found: i64 = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(found > 0)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.query(redis::cmd("TTL").arg(key)).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query(redis::cmd("INCR").arg(key)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        self.query::<()>(redis::cmd("LTRIM").arg(key).arg(start).arg(stop))
            .await
    }

    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> Result<()> {
        // single round-trip for the hot flush path
        let mut pipe = redis::pipe();
        pipe.cmd("LPUSH").arg(key).arg(value).ignore();
        pipe.cmd("LTRIM").arg(key).arg(0).arg(max_len as i64 - 1).ignore();

        let mut attempt = 0;
        loop {
            let mut conn = self.manager.clone();
            let outcome: std::result::Result<(), redis::RedisError> =
                pipe.query_async(&mut conn).await;
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if err.is_io_error() && attempt < self.retry.max_retries => {
                    let delay = self.retry.base_delay * 2u32.pow(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_io_error() => {
                    return Err(KvError::Unavailable(err.to_string()))
                }
                Err(err) => return Err(KvError::Operation(err.to_string())),
            }
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.query::<()>(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(removed > 0)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, mut batch): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(1000),
                )
                .await?;
            keys.append(&mut batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
