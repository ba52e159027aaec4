//! Rate Tasks and the Alarm State Machine
//!
//! A [`RateTask`] periodically pulls recent buckets for one monitored key,
//! gap-fills missing intervals with zeros, feeds each sample to its
//! detector and drives the hysteretic alarm state machine: `duration`
//! consecutive firing samples to go Active, `duration` consecutive quiet
//! samples to clear.
//!
//! Alarm state is mirrored to the store (`<key>:alarm` holds the
//! activation timestamp; cleared alarms append `[since, cleared]` to
//! `<key>:alarm-history`), so a restarted monitor resumes an active alarm
//! without re-alerting.

use serde_json::{json, Map};
use tracing::{debug, info};

use crate::alert::{AlertLevel, AlertManager};
use crate::detect::{AnomalyDetectionManager, AnomalyKind, DetectionResult, DetectorConfig};
use crate::kv::{KvStore, Result};

/// Buckets fetched from the head of the series per tick
pub const WINDOW_SIZE: usize = 25;

/// Bound on the per-key alarm history list
pub const MAX_ALARM_HISTORY: usize = 1000;

/// Bound on the per-key stored anomaly records
pub const MAX_ANOMALY_RECORDS: usize = 500;

/// Per-key alarm state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlarmState {
    /// No alarm, no recent breaches
    Clear,
    /// Consecutive breaches counting toward activation
    Arming(u32),
    /// Alarm active since the timestamp, with the latest breach magnitude
    Active { since: u64, magnitude: f64 },
    /// Consecutive quiet samples counting toward clearing
    Clearing { since: u64, ok_count: u32 },
}

impl AlarmState {
    /// Whether the alarm is set (Active or still Clearing)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AlarmState::Active { .. } | AlarmState::Clearing { .. }
        )
    }
}

/// Monitored-rate parameters from configuration:
/// `<name>_rate = "<key>, <interval_s>, <max_value>, <duration>"`
#[derive(Debug, Clone, PartialEq)]
pub struct RateSpec {
    /// Monitored series key, including the resolution label (`total:s`)
    pub key: String,
    /// Sample interval in seconds
    pub interval: u64,
    /// Threshold value
    pub max_value: f64,
    /// Consecutive samples required to set or clear the alarm
    pub duration: u32,
}

impl RateSpec {
    /// Parse the configuration shape `"key, interval, max_value, duration"`.
    /// Split from the right so family keys containing commas survive.
    pub fn parse(value: &str) -> Option<RateSpec> {
        let mut parts: Vec<&str> = value.rsplitn(4, ',').map(str::trim).collect();
        if parts.len() != 4 {
            return None;
        }
        parts.reverse();
        Some(RateSpec {
            key: parts[0].to_string(),
            interval: parts[1].parse().ok()?,
            max_value: parts[2].parse().ok()?,
            duration: parts[3].parse().ok()?,
        })
    }
}

/// Detection strategy for one rate task
enum RateDetector {
    /// Plain threshold comparison
    Threshold { max_value: f64 },
    /// Full detector set
    Enhanced(Box<AnomalyDetectionManager>),
}

impl RateDetector {
    fn evaluate(&mut self, ts: u64, value: f64) -> DetectionResult {
        match self {
            RateDetector::Threshold { max_value } => {
                let firing = value > *max_value;
                let mut kinds = std::collections::BTreeSet::new();
                let mut context = Map::new();
                context.insert("value".to_string(), json!(value));
                context.insert("threshold".to_string(), json!(*max_value));
                context.insert("ts".to_string(), json!(ts));
                if firing {
                    kinds.insert(AnomalyKind::Threshold);
                }
                DetectionResult {
                    anomalous: firing,
                    kinds,
                    score: if firing { 1.0 } else { 0.0 },
                    context,
                }
            }
            RateDetector::Enhanced(manager) => {
                manager.add_sample(ts, value);
                manager.detect()
            }
        }
    }
}

/// Alert level for an activation, derived from the firing kinds
fn level_for(result: &DetectionResult) -> AlertLevel {
    let has = |kind: AnomalyKind| result.kinds.contains(&kind);
    if has(AnomalyKind::Threshold) || has(AnomalyKind::Spike) || has(AnomalyKind::RateOfChange) {
        AlertLevel::Warning
    } else if has(AnomalyKind::ZScore)
        || has(AnomalyKind::TimePattern)
        || has(AnomalyKind::IncreasingTrend)
        || has(AnomalyKind::DecreasingTrend)
    {
        AlertLevel::Alert
    } else {
        AlertLevel::Critical
    }
}

/// Periodic rate check for one monitored key
pub struct RateTask {
    spec: RateSpec,
    detector: RateDetector,
    state: AlarmState,
    next_check: u64,
    last_result: Option<DetectionResult>,
}

impl RateTask {
    /// Build a task in plain threshold mode
    pub fn threshold(spec: RateSpec, now: u64) -> Self {
        let detector = RateDetector::Threshold {
            max_value: spec.max_value,
        };
        Self::build(spec, detector, now)
    }

    /// Build a task running the full detector set
    pub fn enhanced(spec: RateSpec, config: &DetectorConfig, now: u64) -> Self {
        let config = DetectorConfig {
            base_threshold: spec.max_value,
            duration: spec.duration,
            ..*config
        };
        let detector = RateDetector::Enhanced(Box::new(AnomalyDetectionManager::new(&config)));
        Self::build(spec, detector, now)
    }

    fn build(spec: RateSpec, detector: RateDetector, now: u64) -> Self {
        let aligned = now - (now % spec.interval);
        // start far enough back to evaluate a full arming window
        let next_check = aligned.saturating_sub(spec.interval * spec.duration as u64);
        RateTask {
            spec,
            detector,
            state: AlarmState::Clear,
            next_check,
            last_result: None,
        }
    }

    /// Restore alarm state from the store. An alarm set by a previous
    /// process resumes as Active and samples before the activation are
    /// skipped to avoid double-alerting.
    pub async fn recover(&mut self, kv: &dyn KvStore) -> Result<()> {
        if let Some(since) = kv.get(&self.alarm_key()).await? {
            if let Ok(since) = since.parse::<u64>() {
                debug!(key = %self.spec.key, since, "resuming active alarm");
                self.state = AlarmState::Active {
                    since,
                    magnitude: 0.0,
                };
                self.next_check = self.next_check.max(since);
            }
        }
        Ok(())
    }

    /// Monitored key
    pub fn key(&self) -> &str {
        &self.spec.key
    }

    /// Current alarm state
    pub fn state(&self) -> AlarmState {
        self.state
    }

    /// Next tick's starting timestamp
    pub fn next_check(&self) -> u64 {
        self.next_check
    }

    /// Result of the last evaluated sample, for observability
    pub fn last_result(&self) -> Option<&DetectionResult> {
        self.last_result.as_ref()
    }

    fn alarm_key(&self) -> String {
        format!("{}:alarm", self.spec.key)
    }

    /// Fetch recent buckets and gap-fill: every aligned interval in
    /// `[start, end]` yields a sample, zero when no bucket exists. Never
    /// yields past `end`.
    pub async fn yield_samples(
        &self,
        kv: &dyn KvStore,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, u64)>> {
        let records = kv
            .lrange(&self.spec.key, 0, WINDOW_SIZE as i64 - 1)
            .await?;

        let mut buckets: Vec<crate::count::Bucket> = records
            .iter()
            .filter_map(|record| crate::count::parse_record(record))
            .collect();
        buckets.reverse();

        let mut samples = Vec::new();
        let mut next = start;
        for bucket in buckets {
            if bucket.ts < next {
                continue;
            }
            while next < bucket.ts && next <= end {
                samples.push((next, 0));
                next += self.spec.interval;
            }
            if next > end {
                break;
            }
            samples.push((bucket.ts, bucket.count));
            next = bucket.ts + self.spec.interval;
        }

        Ok(samples)
    }

    /// Run one periodic check. Processes every sample between `next_check`
    /// and the aligned current time, then advances `next_check` to the last
    /// sample's timestamp plus one interval (or to now when nothing was
    /// yielded).
    pub async fn tick(
        &mut self,
        kv: &dyn KvStore,
        alerts: &AlertManager,
        now: u64,
    ) -> Result<Option<DetectionResult>> {
        let aligned_now = now - (now % self.spec.interval);
        let samples = self.yield_samples(kv, self.next_check, aligned_now).await?;

        match samples.last() {
            Some(&(last_ts, _)) => self.next_check = last_ts + self.spec.interval,
            None => self.next_check = aligned_now,
        }

        for (ts, value) in samples {
            let result = self.detector.evaluate(ts, value as f64);
            self.step(kv, alerts, ts, value as f64, &result).await?;
            self.last_result = Some(result);
        }

        Ok(self.last_result.clone())
    }

    /// Apply one sample's verdict to the alarm state machine
    async fn step(
        &mut self,
        kv: &dyn KvStore,
        alerts: &AlertManager,
        ts: u64,
        value: f64,
        result: &DetectionResult,
    ) -> Result<()> {
        if result.anomalous {
            let record = json!({
                "ts": ts,
                "value": value,
                "score": result.score,
                "kinds": result.kind_labels(),
            });
            kv.lpush_trim(
                &format!("{}:anomalies", self.spec.key),
                &record.to_string(),
                MAX_ANOMALY_RECORDS,
            )
            .await?;
        }

        match self.state {
            AlarmState::Clear | AlarmState::Arming(_) => {
                if result.anomalous {
                    let count = match self.state {
                        AlarmState::Arming(count) => count + 1,
                        _ => 1,
                    };
                    if count >= self.spec.duration {
                        self.activate(kv, alerts, ts, value, result).await?;
                    } else {
                        self.state = AlarmState::Arming(count);
                    }
                } else {
                    self.state = AlarmState::Clear;
                }
            }
            AlarmState::Active { since, .. } => {
                if result.anomalous {
                    self.state = AlarmState::Active {
                        since,
                        magnitude: value,
                    };
                } else if self.spec.duration <= 1 {
                    self.clear(kv, alerts, since, ts).await?;
                } else {
                    self.state = AlarmState::Clearing { since, ok_count: 1 };
                }
            }
            AlarmState::Clearing { since, ok_count } => {
                if result.anomalous {
                    self.state = AlarmState::Active {
                        since,
                        magnitude: value,
                    };
                } else {
                    let ok_count = ok_count + 1;
                    if ok_count >= self.spec.duration {
                        self.clear(kv, alerts, since, ts).await?;
                    } else {
                        self.state = AlarmState::Clearing { since, ok_count };
                    }
                }
            }
        }

        Ok(())
    }

    async fn activate(
        &mut self,
        kv: &dyn KvStore,
        alerts: &AlertManager,
        ts: u64,
        value: f64,
        result: &DetectionResult,
    ) -> Result<()> {
        self.state = AlarmState::Active {
            since: ts,
            magnitude: value,
        };
        kv.set(&self.alarm_key(), &ts.to_string()).await?;

        let kinds = result.kind_labels().join(",");
        info!(key = %self.spec.key, ts, kinds = %kinds, "rate alarm active");

        // legacy set entry; written even when the structured alert is
        // suppressed downstream (maintenance windows gate only alerts)
        let legacy = format!("-/{}/Rate Exceeded", self.spec.key);
        kv.sadd("critical-messages", &legacy).await?;

        let mut details = Map::new();
        details.insert("kinds".to_string(), json!(result.kind_labels()));
        details.insert("score".to_string(), json!(result.score));
        details.insert("value".to_string(), json!(value));
        details.insert("threshold".to_string(), json!(self.spec.max_value));
        details.insert("interval".to_string(), json!(self.spec.interval));

        let message = format!(
            "Rate of {} exceeded configured limits ({}) starting at {}",
            self.spec.key,
            if kinds.is_empty() { "threshold" } else { &kinds },
            ts,
        );

        let _ = alerts
            .create(
                "rate-anomaly",
                &message,
                level_for(result),
                "rate-monitor",
                Some(self.spec.key.clone()),
                details,
                ts,
            )
            .await;

        Ok(())
    }

    async fn clear(
        &mut self,
        kv: &dyn KvStore,
        alerts: &AlertManager,
        since: u64,
        ts: u64,
    ) -> Result<()> {
        self.state = AlarmState::Clear;
        kv.delete(&self.alarm_key()).await?;
        kv.lpush_trim(
            &format!("{}:alarm-history", self.spec.key),
            &crate::count::format_record(since, ts),
            MAX_ALARM_HISTORY,
        )
        .await?;

        info!(key = %self.spec.key, since, cleared = ts, "rate alarm cleared");
        alerts.resolve_matching("rate-anomaly", &self.spec.key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RateLimit;
    use crate::kv::MemoryKv;
    use std::sync::Arc;

    fn spec() -> RateSpec {
        RateSpec {
            key: "K:s".to_string(),
            interval: 1,
            max_value: 10.0,
            duration: 3,
        }
    }

    fn alerts(kv: Arc<MemoryKv>) -> AlertManager {
        AlertManager::new(kv, Vec::new(), RateLimit::default())
    }

    async fn store_series(kv: &MemoryKv, key: &str, buckets: &[(u64, u64)]) {
        for (ts, count) in buckets {
            kv.lpush(key, &crate::count::format_record(*ts, *count))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_rate_spec_parse() {
        assert_eq!(
            RateSpec::parse("total:s, 1, 20, 30"),
            Some(RateSpec {
                key: "total:s".to_string(),
                interval: 1,
                max_value: 20.0,
                duration: 30,
            })
        );
        assert_eq!(RateSpec::parse("total:s, 1, 20"), None);
        assert_eq!(RateSpec::parse("total:s, x, 20, 30"), None);
    }

    #[tokio::test]
    async fn test_gap_filling() {
        let kv = MemoryKv::new();
        // buckets at 100 and 103; 101 and 102 are missing
        store_series(&kv, "K:s", &[(100, 5), (103, 7)]).await;

        let task = RateTask::threshold(spec(), 105);
        let samples = task.yield_samples(&kv, 100, 104).await.unwrap();
        // missing intervals between known buckets fill with zeros; nothing
        // is invented past the newest bucket
        assert_eq!(samples, vec![(100, 5), (101, 0), (102, 0), (103, 7)]);
    }

    #[tokio::test]
    async fn test_gap_filling_never_exceeds_end() {
        let kv = MemoryKv::new();
        store_series(&kv, "K:s", &[(100, 5), (110, 7)]).await;

        let task = RateTask::threshold(spec(), 120);
        let samples = task.yield_samples(&kv, 100, 104).await.unwrap();
        assert_eq!(
            samples,
            vec![(100, 5), (101, 0), (102, 0), (103, 0), (104, 0)]
        );
        assert!(samples.iter().all(|&(ts, _)| ts <= 104));
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let kv = MemoryKv::new();
        kv.lpush("K:s", "[100, 5]").await.unwrap();
        kv.lpush("K:s", "[__evil__, 5]").await.unwrap();
        kv.lpush("K:s", "[102, 3]").await.unwrap();

        let task = RateTask::threshold(spec(), 105);
        let samples = task.yield_samples(&kv, 100, 102).await.unwrap();
        assert_eq!(samples, vec![(100, 5), (101, 0), (102, 3)]);
    }

    #[tokio::test]
    async fn test_alarm_arming_and_auto_clear() {
        let kv = Arc::new(MemoryKv::new());
        let alerts = alerts(kv.clone());

        // counts over eight consecutive seconds
        let counts = [5u64, 12, 15, 14, 13, 4, 3, 2];
        let buckets: Vec<(u64, u64)> = counts
            .iter()
            .enumerate()
            .map(|(index, &count)| (100 + index as u64, count))
            .collect();
        store_series(&kv, "K:s", &buckets).await;

        let mut task = RateTask::threshold(spec(), 100);
        task.next_check = 100;
        task.tick(&*kv, &alerts, 108).await.unwrap();

        // breaches at 101, 102, 103: active at the third consecutive breach
        assert_eq!(kv.get("K:s:alarm").await.unwrap(), None);
        assert_eq!(
            kv.lrange("K:s:alarm-history", 0, 0).await.unwrap(),
            vec!["[103, 107]"]
        );
        assert_eq!(task.state(), AlarmState::Clear);

        // the structured alert was raised and then auto-resolved
        assert_eq!(alerts.active_count().await, 0);
        assert_eq!(alerts.history(AlertLevel::Debug, 10, 0).await.len(), 1);
        let resolved = &alerts.history(AlertLevel::Debug, 10, 0).await[0];
        assert_eq!(resolved.level, AlertLevel::Warning);
        assert_eq!(resolved.entity.as_deref(), Some("K:s"));

        // legacy set entry persists
        let legacy = kv.smembers("critical-messages").await.unwrap();
        assert_eq!(legacy, vec!["-/K:s/Rate Exceeded"]);
    }

    #[tokio::test]
    async fn test_alarm_active_mid_breach() {
        let kv = Arc::new(MemoryKv::new());
        let alerts = alerts(kv.clone());

        store_series(&kv, "K:s", &[(100, 5), (101, 12), (102, 15), (103, 14)]).await;

        let mut task = RateTask::threshold(spec(), 100);
        task.next_check = 100;
        task.tick(&*kv, &alerts, 104).await.unwrap();

        assert_eq!(kv.get("K:s:alarm").await.unwrap(), Some("103".to_string()));
        assert!(task.state().is_active());
        assert_eq!(alerts.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_clearing_resets_on_new_breach() {
        let kv = Arc::new(MemoryKv::new());
        let alerts = alerts(kv.clone());

        // breach, two quiet, breach again: alarm must stay active
        let counts = [12u64, 15, 14, 4, 3, 12, 15];
        let buckets: Vec<(u64, u64)> = counts
            .iter()
            .enumerate()
            .map(|(index, &count)| (100 + index as u64, count))
            .collect();
        store_series(&kv, "K:s", &buckets).await;

        let mut task = RateTask::threshold(spec(), 100);
        task.next_check = 100;
        task.tick(&*kv, &alerts, 107).await.unwrap();

        assert!(task.state().is_active());
        assert!(kv.exists("K:s:alarm").await.unwrap());
        assert_eq!(kv.llen("K:s:alarm-history").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_next_check_advance() {
        let kv = Arc::new(MemoryKv::new());
        let alerts = alerts(kv.clone());

        let mut task = RateTask::threshold(spec(), 100);
        task.next_check = 100;

        // no samples at all: next_check advances to aligned now
        task.tick(&*kv, &alerts, 105).await.unwrap();
        assert_eq!(task.next_check(), 105);

        // with samples: advances past the last yielded sample
        store_series(&kv, "K:s", &[(105, 1), (106, 2)]).await;
        task.tick(&*kv, &alerts, 107).await.unwrap();
        assert_eq!(task.next_check(), 107);
    }

    #[tokio::test]
    async fn test_recovery_resumes_active_alarm() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("K:s:alarm", "95").await.unwrap();

        let mut task = RateTask::threshold(spec(), 100);
        task.recover(&*kv).await.unwrap();

        assert!(task.state().is_active());
        assert!(task.next_check() >= 95);
    }

    #[tokio::test]
    async fn test_anomaly_records_stored() {
        let kv = Arc::new(MemoryKv::new());
        let alerts = alerts(kv.clone());

        store_series(&kv, "K:s", &[(100, 50), (101, 50), (102, 50)]).await;
        let mut task = RateTask::threshold(spec(), 100);
        task.next_check = 100;
        task.tick(&*kv, &alerts, 103).await.unwrap();

        let records = kv.lrange("K:s:anomalies", 0, -1).await.unwrap();
        assert_eq!(records.len(), 3);
        let parsed: serde_json::Value = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(parsed["value"], json!(50.0));
        assert_eq!(parsed["kinds"], json!(["threshold"]));
    }
}
