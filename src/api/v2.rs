//! v2 Endpoints: SSE Streams and Aggregation
//!
//! The streams poll the store (the monitor and the API are separate
//! processes sharing nothing else) and emit an event per newly
//! observed head bucket (`bucket`) or newly admitted alert (`alert`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};

use crate::alert::AlertLevel;
use crate::api::auth::Permission;
use crate::api::error::{ApiError, ParamErrorCode};
use crate::api::{parse_interval, parse_time_range, success, ApiState};
use crate::count::{parse_record, Bucket};
use crate::unix_now;

type Params = Query<HashMap<String, String>>;

fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str)
}

fn required_keys(params: &HashMap<String, String>) -> Result<Vec<String>, ApiError> {
    let keys: Vec<String> = param(params, "keys")
        .map(|keys| {
            keys.split(',')
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if keys.is_empty() {
        return Err(ApiError::BadRequest(
            ParamErrorCode::MissingRequired,
            "keys is required".to_string(),
        ));
    }
    Ok(keys)
}

struct MonitorStream {
    state: ApiState,
    keys: Vec<String>,
    label: &'static str,
    last_seen: HashMap<String, u64>,
    pending: VecDeque<Event>,
}

/// GET /api/v2/monitoring/stream: one `bucket` event per newly flushed
/// bucket for the subscribed keys
pub async fn monitoring_stream(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Response, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let resolution = parse_interval(param(&params, "interval"))?;
    let keys = required_keys(&params)?;

    // start from the current heads so only new flushes stream out
    let mut last_seen = HashMap::new();
    for key in &keys {
        let series = format!("{}:{}", key, resolution.label());
        if let Some(bucket) = head_bucket(&state, &series).await? {
            last_seen.insert(key.clone(), bucket.ts);
        }
    }

    let stream_state = MonitorStream {
        state,
        keys,
        label: resolution.label(),
        last_seen,
        pending: VecDeque::new(),
    };

    let stream = futures::stream::unfold(stream_state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok::<Event, Infallible>(event), st));
            }

            tokio::time::sleep(Duration::from_secs(1)).await;

            for index in 0..st.keys.len() {
                let key = st.keys[index].clone();
                let series = format!("{}:{}", key, st.label);
                let Ok(Some(bucket)) = head_bucket(&st.state, &series).await else {
                    continue;
                };
                let seen = st.last_seen.get(&key).copied().unwrap_or(0);
                if bucket.ts > seen {
                    st.last_seen.insert(key.clone(), bucket.ts);
                    let payload = json!({
                        "key": key,
                        "ts": bucket.ts,
                        "count": bucket.count,
                    });
                    st.pending
                        .push_back(Event::default().event("bucket").data(payload.to_string()));
                }
            }
        }
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn head_bucket(state: &ApiState, series: &str) -> Result<Option<Bucket>, ApiError> {
    let records = state.kv.lrange(series, 0, 0).await?;
    Ok(records.first().and_then(|record| parse_record(record)))
}

struct AlertStream {
    state: ApiState,
    seen: HashSet<String>,
    pending: VecDeque<Event>,
}

/// GET /api/v2/alerts/stream: one `alert` event per newly admitted alert
pub async fn alerts_stream(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let seen: HashSet<String> = state
        .alerts
        .active_alerts(AlertLevel::Debug)
        .await
        .into_iter()
        .map(|alert| alert.uuid)
        .collect();

    let stream_state = AlertStream {
        state,
        seen,
        pending: VecDeque::new(),
    };

    let stream = futures::stream::unfold(stream_state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok::<Event, Infallible>(event), st));
            }

            tokio::time::sleep(Duration::from_secs(2)).await;

            let active = st.state.alerts.active_alerts(AlertLevel::Debug).await;
            for alert in active {
                if st.seen.insert(alert.uuid.clone()) {
                    let payload =
                        serde_json::to_string(&alert).unwrap_or_else(|_| "{}".to_string());
                    st.pending
                        .push_back(Event::default().event("alert").data(payload));
                }
            }
        }
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateFunction {
    Avg,
    Max,
    Min,
    Sum,
    Count,
    First,
    Last,
}

impl AggregateFunction {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "avg" => Some(Self::Avg),
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            _ => None,
        }
    }

    /// Apply to one window's chronologically ordered counts
    fn apply(&self, counts: &[u64]) -> f64 {
        match self {
            Self::Avg => counts.iter().sum::<u64>() as f64 / counts.len() as f64,
            Self::Max => counts.iter().copied().max().unwrap_or(0) as f64,
            Self::Min => counts.iter().copied().min().unwrap_or(0) as f64,
            Self::Sum => counts.iter().sum::<u64>() as f64,
            Self::Count => counts.len() as f64,
            Self::First => counts.first().copied().unwrap_or(0) as f64,
            Self::Last => counts.last().copied().unwrap_or(0) as f64,
        }
    }
}

/// GET /api/v2/data/aggregate
pub async fn aggregate(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let keys = required_keys(&params)?;
    let function = param(&params, "function")
        .and_then(AggregateFunction::parse)
        .ok_or_else(|| {
            ApiError::BadRequest(
                ParamErrorCode::BadValue,
                "function must be avg|max|min|sum|count|first|last".to_string(),
            )
        })?;
    let window: u64 = param(&params, "window")
        .unwrap_or("60")
        .parse()
        .ok()
        .filter(|window| *window > 0)
        .ok_or_else(|| {
            ApiError::BadRequest(
                ParamErrorCode::BadValue,
                "window must be a positive number of seconds".to_string(),
            )
        })?;

    let now = unix_now();
    let resolution = parse_interval(param(&params, "interval"))?;
    let (start, end) = parse_time_range(
        param(&params, "range"),
        param(&params, "start"),
        param(&params, "end"),
        now,
    )?;

    let mut data = Map::new();
    for key in keys {
        let series = format!("{}:{}", key, resolution.label());
        let mut buckets: Vec<Bucket> = state
            .kv
            .lrange(&series, 0, -1)
            .await?
            .iter()
            .filter_map(|record| parse_record(record))
            .filter(|bucket| bucket.ts >= start && bucket.ts <= end)
            .collect();
        buckets.sort_by_key(|bucket| bucket.ts);

        let mut windows: Vec<(u64, Vec<u64>)> = Vec::new();
        for bucket in buckets {
            let window_start = bucket.ts - (bucket.ts % window);
            match windows.last_mut() {
                Some((current, counts)) if *current == window_start => {
                    counts.push(bucket.count)
                }
                _ => windows.push((window_start, vec![bucket.count])),
            }
        }

        let aggregated: Vec<Value> = windows
            .iter()
            .map(|(window_start, counts)| {
                json!({
                    "window_start": window_start,
                    "value": function.apply(counts),
                })
            })
            .collect();
        data.insert(key, Value::Array(aggregated));
    }

    Ok(success(json!({
        "function": param(&params, "function"),
        "window": window,
        "data": data,
    })))
}
