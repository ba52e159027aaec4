//! Multi-Resolution Counting Engine
//!
//! Per-family packet counters at second, minute and hour resolution. The
//! open bucket for each resolution is batched in memory and mirrored to
//! the store (`<key>:<res>i` holds the open bucket's aligned timestamp,
//! `<key>:<res>n` its count) so a restarted monitor adopts the open count
//! instead of resetting it. Completed buckets are pushed newest-first onto
//! the `<key>:<res>` series list and trimmed to the resolution's bound.
//!
//! Bucket records are stored as `"[<ts>, <count>]"`: valid JSON that is
//! also byte-compatible with the legacy bracketed record shape, so series
//! written by earlier deployments interleave safely with new ones.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::kv::{KvStore, Result};

/// One completed counting interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Aligned start of the interval (seconds since epoch)
    pub ts: u64,
    /// Packets counted in the interval
    pub count: u64,
}

/// Counting resolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Second,
    Minute,
    Hour,
}

impl Resolution {
    /// Store-key suffix for this resolution
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Second => "s",
            Resolution::Minute => "m",
            Resolution::Hour => "h",
        }
    }

    /// Interval width in seconds
    pub fn modulus(&self) -> u64 {
        match self {
            Resolution::Second => 1,
            Resolution::Minute => 60,
            Resolution::Hour => 3600,
        }
    }

    /// Default series bound
    pub fn default_max_len(&self) -> usize {
        match self {
            Resolution::Second => 900,
            Resolution::Minute => 1440,
            Resolution::Hour => 168,
        }
    }

    /// Align a timestamp down to this resolution's modulus
    pub fn align(&self, t: u64) -> u64 {
        t - (t % self.modulus())
    }

    /// All resolutions, coarsest last
    pub fn all() -> [Resolution; 3] {
        [Resolution::Second, Resolution::Minute, Resolution::Hour]
    }

    /// Look a resolution up by its store-key suffix
    pub fn from_label(label: &str) -> Option<Resolution> {
        match label {
            "s" => Some(Resolution::Second),
            "m" => Some(Resolution::Minute),
            "h" => Some(Resolution::Hour),
            _ => None,
        }
    }
}

/// Render a bucket record for storage
pub fn format_record(ts: u64, count: u64) -> String {
    format!("[{}, {}]", ts, count)
}

/// Parse a stored bucket record.
///
/// Accepts the JSON form written by this implementation and the legacy
/// bracketed form identically; anything non-numeric is rejected.
pub fn parse_record(record: &str) -> Option<Bucket> {
    let inner = record.trim().strip_prefix('[')?.strip_suffix(']')?;
    let mut parts = inner.splitn(2, ',');
    let ts: u64 = parts.next()?.trim().parse().ok()?;
    let count: u64 = parts.next()?.trim().parse().ok()?;
    Some(Bucket { ts, count })
}

/// Per-resolution counter with an in-memory open bucket
#[derive(Debug)]
pub struct CountInterval {
    resolution: Resolution,
    max_len: usize,
    /// Open-bucket counts by series key (`<family>:<res>`)
    cache: HashMap<String, i64>,
    /// Aligned start of the open interval
    last_interval: u64,
}

impl CountInterval {
    /// Create a counter for one resolution; `now` seeds the open interval
    /// so a freshly started monitor adopts stored open buckets.
    pub fn new(resolution: Resolution, max_len: usize, now: u64) -> Self {
        CountInterval {
            resolution,
            max_len,
            cache: HashMap::new(),
            last_interval: resolution.align(now),
        }
    }

    /// The counter's resolution
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Open-bucket count for a family key, if cached
    pub fn open_count(&self, key: &str) -> Option<i64> {
        self.cache
            .get(&format!("{}:{}", key, self.resolution.label()))
            .copied()
    }

    /// Count one packet for `key` at time `now`
    pub async fn count(&mut self, kv: &dyn KvStore, key: &str, now: u64) -> Result<()> {
        let series = format!("{}:{}", key, self.resolution.label());
        let marker = format!("{}i", series);
        let open = format!("{}n", series);

        let interval = self.resolution.align(now);
        let mut trigger = false;

        if interval != self.last_interval {
            // the open interval ended: push every cached bucket
            self.flush(kv).await?;
            self.last_interval = interval;
            trigger = true;
        } else if self.cache.contains_key(&series) {
            let count = kv.incr(&open).await?;
            self.cache.insert(series.clone(), count);
        } else {
            match kv.get(&marker).await? {
                None => trigger = true,
                Some(stored) => {
                    let stored_interval: u64 = stored.parse().unwrap_or(0);
                    if stored_interval == interval {
                        // open bucket survives from a previous process
                        let count = kv.incr(&open).await?;
                        self.cache.insert(series.clone(), count);
                    } else {
                        // stale open bucket: complete it before starting over
                        if let Some(count) = kv.get(&open).await? {
                            if let Ok(count) = count.parse::<u64>() {
                                kv.lpush_trim(
                                    &series,
                                    &format_record(stored_interval, count),
                                    self.max_len,
                                )
                                .await?;
                            }
                        }
                        trigger = true;
                    }
                }
            }
        }

        if trigger {
            self.cache.insert(series.clone(), 1);
            kv.set(&marker, &interval.to_string()).await?;
            kv.set(&open, "1").await?;
        }

        Ok(())
    }

    /// Push every cached open bucket to its series and clear the cache.
    /// Called on interval rollover and at shutdown.
    pub async fn flush(&mut self, kv: &dyn KvStore) -> Result<()> {
        let flushed: Vec<(String, i64)> = self.cache.drain().collect();
        for (series, count) in flushed {
            kv.lpush_trim(
                &series,
                &format_record(self.last_interval, count.max(0) as u64),
                self.max_len,
            )
            .await?;
            kv.delete(&format!("{}i", series)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn test_alignment() {
        assert_eq!(Resolution::Second.align(100), 100);
        assert_eq!(Resolution::Minute.align(125), 120);
        assert_eq!(Resolution::Hour.align(7300), 7200);
    }

    #[test]
    fn test_record_round_trip() {
        let record = format_record(100, 5);
        assert_eq!(record, "[100, 5]");
        assert_eq!(
            parse_record(&record),
            Some(Bucket { ts: 100, count: 5 })
        );
        // legacy spacing variants parse identically
        assert_eq!(
            parse_record("[100,5]"),
            Some(Bucket { ts: 100, count: 5 })
        );
        assert_eq!(
            parse_record("  [ 100 , 5 ] "),
            Some(Bucket { ts: 100, count: 5 })
        );
    }

    #[test]
    fn test_record_rejects_non_numeric() {
        assert_eq!(parse_record("[__import__, 5]"), None);
        assert_eq!(parse_record("[100]"), None);
        assert_eq!(parse_record("100, 5"), None);
        assert_eq!(parse_record("[1e3, 5]"), None);
    }

    #[tokio::test]
    async fn test_first_packet_initializes_open_bucket() {
        let kv = MemoryKv::new();
        let mut interval = CountInterval::new(Resolution::Second, 900, 100);
        interval.count(&kv, "K", 100).await.unwrap();

        assert_eq!(interval.open_count("K"), Some(1));
        assert_eq!(kv.get("K:si").await.unwrap(), Some("100".to_string()));
        assert_eq!(kv.get("K:sn").await.unwrap(), Some("1".to_string()));
        // no history has been flushed
        assert_eq!(kv.llen("K:s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bucket_rollover() {
        let kv = MemoryKv::new();
        let mut interval = CountInterval::new(Resolution::Second, 900, 100);

        for _ in 0..5 {
            interval.count(&kv, "K", 100).await.unwrap();
        }
        for _ in 0..3 {
            interval.count(&kv, "K", 101).await.unwrap();
        }

        assert_eq!(kv.lrange("K:s", 0, 0).await.unwrap(), vec!["[100, 5]"]);
        assert_eq!(interval.open_count("K"), Some(3));
        assert_eq!(kv.get("K:sn").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_rollover_flushes_whole_map() {
        let kv = MemoryKv::new();
        let mut interval = CountInterval::new(Resolution::Second, 900, 200);

        interval.count(&kv, "A", 200).await.unwrap();
        interval.count(&kv, "B", 200).await.unwrap();
        interval.count(&kv, "B", 200).await.unwrap();
        interval.count(&kv, "A", 201).await.unwrap();

        assert_eq!(kv.lrange("A:s", 0, 0).await.unwrap(), vec!["[200, 1]"]);
        assert_eq!(kv.lrange("B:s", 0, 0).await.unwrap(), vec!["[200, 2]"]);
        // only A has an open bucket in the new interval
        assert_eq!(interval.open_count("A"), Some(1));
        assert_eq!(interval.open_count("B"), None);
    }

    #[tokio::test]
    async fn test_restart_adopts_open_bucket() {
        let kv = MemoryKv::new();

        let mut first = CountInterval::new(Resolution::Second, 900, 300);
        for _ in 0..50 {
            first.count(&kv, "K", 300).await.unwrap();
        }
        drop(first);

        // restarted monitor, same aligned interval
        let mut second = CountInterval::new(Resolution::Second, 900, 300);
        second.count(&kv, "K", 300).await.unwrap();
        assert_eq!(second.open_count("K"), Some(51));
        assert_eq!(kv.get("K:sn").await.unwrap(), Some("51".to_string()));
    }

    #[tokio::test]
    async fn test_stale_open_bucket_is_completed() {
        let kv = MemoryKv::new();
        kv.set("K:si", "250").await.unwrap();
        kv.set("K:sn", "7").await.unwrap();

        let mut interval = CountInterval::new(Resolution::Second, 900, 300);
        interval.count(&kv, "K", 300).await.unwrap();

        assert_eq!(kv.lrange("K:s", 0, 0).await.unwrap(), vec!["[250, 7]"]);
        assert_eq!(interval.open_count("K"), Some(1));
    }

    #[tokio::test]
    async fn test_series_invariants_hold() {
        let kv = MemoryKv::new();
        let mut interval = CountInterval::new(Resolution::Second, 5, 1000);

        for t in 1000..1020 {
            interval.count(&kv, "K", t).await.unwrap();
        }

        let records = kv.lrange("K:s", 0, -1).await.unwrap();
        assert!(records.len() <= 5);
        let buckets: Vec<Bucket> = records
            .iter()
            .map(|record| parse_record(record).unwrap())
            .collect();
        for pair in buckets.windows(2) {
            assert!(pair[0].ts > pair[1].ts);
        }
        for bucket in &buckets {
            assert_eq!(bucket.ts % 1, 0);
            assert_eq!(bucket.count, 1);
        }
    }

    #[tokio::test]
    async fn test_minute_resolution_alignment() {
        let kv = MemoryKv::new();
        let mut interval = CountInterval::new(Resolution::Minute, 1440, 125);

        interval.count(&kv, "K", 125).await.unwrap();
        interval.count(&kv, "K", 130).await.unwrap();
        interval.count(&kv, "K", 185).await.unwrap();

        assert_eq!(kv.lrange("K:m", 0, 0).await.unwrap(), vec!["[120, 2]"]);
        assert_eq!(interval.open_count("K"), Some(1));
        assert_eq!(kv.get("K:mi").await.unwrap(), Some("180".to_string()));
    }
}
