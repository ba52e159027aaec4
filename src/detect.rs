//! Rate Anomaly Detectors
//!
//! Four detector families run over the per-key sample windows:
//!
//! - **Threshold**: absolute limit, short-window spike and rate-of-change
//!   checks with a consecutive-sample arming requirement.
//! - **Statistical**: rolling mean/stdev z-score.
//! - **Time-aware**: per `(weekday, hour slot)` baselines so daily and
//!   weekly cycles don't read as anomalies.
//! - **Trend**: normalized linear-regression slope.
//!
//! [`AnomalyDetectionManager`] runs all four and aggregates their
//! confidences with fixed weights. Detector state is rebuildable from the
//! stored series; it is never the source of truth.

use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Datelike, Timelike};
use serde_json::{json, Map, Value};

/// Anomaly kinds reported by the detectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AnomalyKind {
    Threshold,
    Spike,
    RateOfChange,
    ZScore,
    TimePattern,
    IncreasingTrend,
    DecreasingTrend,
}

impl AnomalyKind {
    /// Stable label used in alerts and stored anomaly records
    pub fn label(&self) -> &'static str {
        match self {
            AnomalyKind::Threshold => "threshold",
            AnomalyKind::Spike => "spike",
            AnomalyKind::RateOfChange => "rate_of_change",
            AnomalyKind::ZScore => "z_score",
            AnomalyKind::TimePattern => "time_pattern",
            AnomalyKind::IncreasingTrend => "increasing_trend",
            AnomalyKind::DecreasingTrend => "decreasing_trend",
        }
    }
}

/// Result of one detection pass
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    /// Whether the detector considers the latest sample anomalous
    pub anomalous: bool,
    /// Kinds that fired
    pub kinds: BTreeSet<AnomalyKind>,
    /// Confidence in [0, 1]
    pub score: f64,
    /// Detector-specific context
    pub context: Map<String, Value>,
}

impl DetectionResult {
    fn quiet() -> Self {
        DetectionResult {
            anomalous: false,
            kinds: BTreeSet::new(),
            score: 0.0,
            context: Map::new(),
        }
    }

    fn insufficient(reason: &str) -> Self {
        let mut result = Self::quiet();
        result
            .context
            .insert("reason".to_string(), json!(reason));
        result
    }

    /// Labels of the kinds that fired
    pub fn kind_labels(&self) -> Vec<&'static str> {
        self.kinds.iter().map(|kind| kind.label()).collect()
    }

    fn to_json(&self) -> Value {
        json!({
            "anomalous": self.anomalous,
            "kinds": self.kind_labels(),
            "score": self.score,
            "context": Value::Object(self.context.clone()),
        })
    }
}

/// A stateful per-key detector
pub trait Detector: Send {
    fn add_sample(&mut self, ts: u64, value: f64);
    fn detect(&mut self) -> DetectionResult;
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n-1 denominator)
fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values
        .iter()
        .map(|value| (value - avg).powi(2))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Stdev with the floor that keeps uniform windows from dividing by zero
fn safe_stdev(values: &[f64]) -> f64 {
    stdev(values).max(0.1)
}

fn values_of(window: &VecDeque<(u64, f64)>) -> Vec<f64> {
    window.iter().map(|(_, value)| *value).collect()
}

fn push_bounded(window: &mut VecDeque<(u64, f64)>, sample: (u64, f64), bound: usize) {
    window.push_back(sample);
    while window.len() > bound {
        window.pop_front();
    }
}

/// Threshold detector with spike and rate-of-change checks
#[derive(Debug)]
pub struct ThresholdDetector {
    base_threshold: f64,
    duration: u32,
    spike_sensitivity: f64,
    rate_of_change_threshold: f64,
    window_size: usize,
    window: VecDeque<(u64, f64)>,
    consecutive_count: u32,
}

impl ThresholdDetector {
    pub fn new(
        base_threshold: f64,
        duration: u32,
        window_size: usize,
        spike_sensitivity: f64,
        rate_of_change_threshold: f64,
    ) -> Self {
        ThresholdDetector {
            base_threshold,
            duration,
            spike_sensitivity,
            rate_of_change_threshold,
            window_size,
            window: VecDeque::new(),
            consecutive_count: 0,
        }
    }

    /// Latest sample, if any
    pub fn last_sample(&self) -> Option<(u64, f64)> {
        self.window.back().copied()
    }

    /// Consecutive firing samples so far
    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }
}

impl Detector for ThresholdDetector {
    fn add_sample(&mut self, ts: u64, value: f64) {
        push_bounded(&mut self.window, (ts, value), self.window_size);
    }

    fn detect(&mut self) -> DetectionResult {
        if self.window.len() < 2 {
            return DetectionResult::insufficient("insufficient_data");
        }

        let (ts, value) = *self.window.back().unwrap();
        let exceeds_threshold = value > self.base_threshold;

        // spike: well above the short-window average and near the limit
        let recent: Vec<f64> = values_of(&self.window)
            .iter()
            .rev()
            .take(5)
            .rev()
            .copied()
            .collect();
        let spike = if recent.len() >= 3 {
            let avg_recent = mean(&recent[..recent.len() - 1]);
            value > avg_recent * self.spike_sensitivity && value > self.base_threshold * 0.7
        } else {
            false
        };

        let (prev_ts, prev_value) = self.window[self.window.len() - 2];
        let rate_anomaly = if ts > prev_ts {
            let rate = (value - prev_value).abs() / (ts - prev_ts) as f64;
            rate > self.rate_of_change_threshold
        } else {
            false
        };

        let firing = exceeds_threshold || spike || rate_anomaly;

        let mut result = DetectionResult::quiet();
        result
            .context
            .insert("value".to_string(), json!(value));
        result
            .context
            .insert("threshold".to_string(), json!(self.base_threshold));

        if firing {
            self.consecutive_count += 1;
            if self.consecutive_count >= self.duration {
                if exceeds_threshold {
                    result.kinds.insert(AnomalyKind::Threshold);
                }
                if spike {
                    result.kinds.insert(AnomalyKind::Spike);
                }
                if rate_anomaly {
                    result.kinds.insert(AnomalyKind::RateOfChange);
                }
                result.anomalous = true;
                result.score =
                    (self.consecutive_count as f64 / (self.duration as f64 * 1.5)).min(1.0);
            }
        } else {
            self.consecutive_count = 0;
        }

        result.context.insert(
            "consecutive_count".to_string(),
            json!(self.consecutive_count),
        );
        result
    }
}

/// Rolling z-score detector
#[derive(Debug)]
pub struct StatisticalDetector {
    window_size: usize,
    z_threshold: f64,
    min_history: usize,
    sensitivity: f64,
    window: VecDeque<(u64, f64)>,
}

impl StatisticalDetector {
    pub fn new(window_size: usize, z_threshold: f64, min_history: usize, sensitivity: f64) -> Self {
        StatisticalDetector {
            window_size,
            z_threshold,
            min_history,
            sensitivity,
            window: VecDeque::new(),
        }
    }
}

impl Detector for StatisticalDetector {
    fn add_sample(&mut self, ts: u64, value: f64) {
        push_bounded(&mut self.window, (ts, value), self.window_size);
    }

    fn detect(&mut self) -> DetectionResult {
        if self.window.len() < self.min_history {
            return DetectionResult::insufficient("insufficient_data");
        }

        let Some(&(_, value)) = self.window.back() else {
            return DetectionResult::insufficient("insufficient_data");
        };
        let values = values_of(&self.window);
        let moving_avg = mean(&values);
        let moving_std = safe_stdev(&values);
        let z_score = (value - moving_avg) / moving_std;
        let adjusted_threshold = self.z_threshold / self.sensitivity;

        let mut result = DetectionResult::quiet();
        result.context.insert("z_score".to_string(), json!(z_score));
        result
            .context
            .insert("moving_avg".to_string(), json!(moving_avg));
        result
            .context
            .insert("moving_std".to_string(), json!(moving_std));

        if z_score.abs() > adjusted_threshold {
            result.anomalous = true;
            result.kinds.insert(AnomalyKind::ZScore);
            result.score = (z_score.abs() / (adjusted_threshold * 2.0)).min(1.0);
        }

        result
    }
}

/// Day-of-week / hour-slot aware z-score detector
#[derive(Debug)]
pub struct TimeAwareDetector {
    window_size: usize,
    hour_granularity: u32,
    z_threshold: f64,
    min_history_per_slot: usize,
    sensitivity: f64,
    window: VecDeque<(u64, f64)>,
    slots: HashMap<(u32, u32), VecDeque<(u64, f64)>>,
}

impl TimeAwareDetector {
    pub fn new(
        window_size: usize,
        hour_granularity: u32,
        z_threshold: f64,
        min_history_per_slot: usize,
        sensitivity: f64,
    ) -> Self {
        TimeAwareDetector {
            window_size,
            hour_granularity: hour_granularity.max(1),
            z_threshold,
            min_history_per_slot,
            sensitivity,
            window: VecDeque::new(),
            slots: HashMap::new(),
        }
    }

    fn slot_key(&self, ts: u64) -> (u32, u32) {
        let when = DateTime::from_timestamp(ts as i64, 0).unwrap_or_default();
        let day_of_week = when.weekday().num_days_from_monday();
        let hour_slot = when.hour() / self.hour_granularity;
        (day_of_week, hour_slot)
    }
}

impl Detector for TimeAwareDetector {
    fn add_sample(&mut self, ts: u64, value: f64) {
        push_bounded(&mut self.window, (ts, value), self.window_size);

        let slot_key = self.slot_key(ts);
        let bound = (self.min_history_per_slot * 4).max(20);
        let slot = self.slots.entry(slot_key).or_default();
        push_bounded(slot, (ts, value), bound);
    }

    fn detect(&mut self) -> DetectionResult {
        let (ts, value) = match self.window.back() {
            Some(sample) => *sample,
            None => return DetectionResult::insufficient("no_data"),
        };

        let slot_key = self.slot_key(ts);
        let slot_values = self
            .slots
            .get(&slot_key)
            .map(values_of)
            .unwrap_or_default();

        // fall back to global statistics while the slot is still sparse
        let (expected, std) = if slot_values.len() >= self.min_history_per_slot {
            (mean(&slot_values), safe_stdev(&slot_values))
        } else if self.window.len() >= self.min_history_per_slot {
            let values = values_of(&self.window);
            (mean(&values), safe_stdev(&values))
        } else {
            return DetectionResult::insufficient("insufficient_data");
        };

        let z_score = (value - expected) / std;
        let adjusted_threshold = self.z_threshold / self.sensitivity;

        let mut result = DetectionResult::quiet();
        result.context.insert("z_score".to_string(), json!(z_score));
        result
            .context
            .insert("expected_value".to_string(), json!(expected));
        result
            .context
            .insert("day_of_week".to_string(), json!(slot_key.0));
        result
            .context
            .insert("hour_slot".to_string(), json!(slot_key.1));

        if z_score.abs() > adjusted_threshold {
            result.anomalous = true;
            result.kinds.insert(AnomalyKind::TimePattern);
            result.score = (z_score.abs() / (adjusted_threshold * 2.0)).min(1.0);
        }

        result
    }
}

/// Linear-regression trend detector
#[derive(Debug)]
pub struct TrendDetector {
    window_size: usize,
    trend_window: usize,
    trend_threshold: f64,
    sensitivity: f64,
    window: VecDeque<(u64, f64)>,
}

impl TrendDetector {
    pub fn new(
        window_size: usize,
        trend_window: usize,
        trend_threshold: f64,
        sensitivity: f64,
    ) -> Self {
        TrendDetector {
            window_size,
            trend_window: trend_window.min(window_size),
            trend_threshold,
            sensitivity,
            window: VecDeque::new(),
        }
    }

    /// Normalized regression slope in [-1, 1]; zero for flat ranges
    fn calculate_trend(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }

        let n = values.len();
        let x_mean = (n - 1) as f64 / 2.0;
        let y_mean = mean(values);

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (index, value) in values.iter().enumerate() {
            let dx = index as f64 - x_mean;
            numerator += dx * (value - y_mean);
            denominator += dx * dx;
        }
        if denominator == 0.0 {
            return 0.0;
        }

        let slope = numerator / denominator;
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let max_possible_slope = (max - min) / (n - 1) as f64;
        if max_possible_slope == 0.0 {
            return 0.0;
        }

        (slope / max_possible_slope).clamp(-1.0, 1.0)
    }
}

impl Detector for TrendDetector {
    fn add_sample(&mut self, ts: u64, value: f64) {
        push_bounded(&mut self.window, (ts, value), self.window_size);
    }

    fn detect(&mut self) -> DetectionResult {
        if self.window.len() < self.trend_window {
            return DetectionResult::insufficient("insufficient_data");
        }

        let values = values_of(&self.window);
        let recent = &values[values.len() - self.trend_window..];
        let trend = Self::calculate_trend(recent);
        let adjusted_threshold = self.trend_threshold / self.sensitivity;

        let mut result = DetectionResult::quiet();
        result.context.insert("trend".to_string(), json!(trend));

        if trend.abs() > adjusted_threshold {
            result.anomalous = true;
            result.kinds.insert(if trend > 0.0 {
                AnomalyKind::IncreasingTrend
            } else {
                AnomalyKind::DecreasingTrend
            });
            result.score = (trend.abs() / adjusted_threshold).min(1.0);
        }

        result
    }
}

/// Detector tuning, shared between the manager and the rate tasks
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    pub base_threshold: f64,
    pub duration: u32,
    pub window_size: usize,
    pub sensitivity: f64,
    pub spike_sensitivity: f64,
    pub rate_of_change_threshold: f64,
    pub z_threshold: f64,
    pub trend_window: usize,
    pub trend_threshold: f64,
    pub hour_granularity: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            base_threshold: 20.0,
            duration: 5,
            window_size: 60,
            sensitivity: 1.0,
            spike_sensitivity: 2.0,
            rate_of_change_threshold: 0.5,
            z_threshold: 3.0,
            trend_window: 10,
            trend_threshold: 0.2,
            hour_granularity: 1,
        }
    }
}

const THRESHOLD_WEIGHT: f64 = 1.0;
const STATISTICAL_WEIGHT: f64 = 0.8;
const TIME_AWARE_WEIGHT: f64 = 0.7;
const TREND_WEIGHT: f64 = 0.6;

/// Runs every detector and aggregates their verdicts
pub struct AnomalyDetectionManager {
    threshold: ThresholdDetector,
    statistical: StatisticalDetector,
    time_aware: TimeAwareDetector,
    trend: TrendDetector,
}

impl AnomalyDetectionManager {
    pub fn new(config: &DetectorConfig) -> Self {
        AnomalyDetectionManager {
            threshold: ThresholdDetector::new(
                config.base_threshold,
                config.duration,
                30,
                config.spike_sensitivity,
                config.rate_of_change_threshold,
            ),
            statistical: StatisticalDetector::new(
                config.window_size,
                config.z_threshold,
                10,
                config.sensitivity,
            ),
            time_aware: TimeAwareDetector::new(
                168,
                config.hour_granularity,
                config.z_threshold,
                3,
                config.sensitivity,
            ),
            trend: TrendDetector::new(
                config.window_size,
                config.trend_window,
                config.trend_threshold,
                config.sensitivity,
            ),
        }
    }

    /// Feed a sample to every detector
    pub fn add_sample(&mut self, ts: u64, value: f64) {
        self.threshold.add_sample(ts, value);
        self.statistical.add_sample(ts, value);
        self.time_aware.add_sample(ts, value);
        self.trend.add_sample(ts, value);
    }

    /// Latest sample seen
    pub fn last_sample(&self) -> Option<(u64, f64)> {
        self.threshold.last_sample()
    }

    /// Run every detector and combine: weighted average of confidences,
    /// anomalous when the aggregate clears 0.5 or two detectors agree.
    pub fn detect(&mut self) -> DetectionResult {
        let parts: [(&str, f64, DetectionResult); 4] = [
            ("threshold", THRESHOLD_WEIGHT, self.threshold.detect()),
            ("statistical", STATISTICAL_WEIGHT, self.statistical.detect()),
            ("time_aware", TIME_AWARE_WEIGHT, self.time_aware.detect()),
            ("trend", TREND_WEIGHT, self.trend.detect()),
        ];

        let total_weight: f64 = parts.iter().map(|(_, weight, _)| weight).sum();
        let mut fired = 0u32;
        let mut weighted_score = 0.0;
        let mut kinds = BTreeSet::new();
        let mut detectors = Map::new();

        for (name, weight, result) in &parts {
            if result.anomalous {
                fired += 1;
                weighted_score += result.score * weight;
                kinds.extend(result.kinds.iter().copied());
            }
            detectors.insert(name.to_string(), result.to_json());
        }

        let score = weighted_score / total_weight;
        let anomalous = score > 0.5 || fired >= 2;

        let mut context = Map::new();
        context.insert("detector_count".to_string(), json!(fired));
        context.insert("detectors".to_string(), Value::Object(detectors));
        if let Some((ts, value)) = self.last_sample() {
            context.insert("ts".to_string(), json!(ts));
            context.insert("value".to_string(), json!(value));
        }

        DetectionResult {
            anomalous,
            kinds,
            score,
            context,
        }
    }
}
