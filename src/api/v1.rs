//! v1 Endpoints
//!
//! Read-only queries over the store plus the mutating alert endpoints.
//! Handler outputs all use the standard envelope; validation failures map
//! to 400 with a parameter error code.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};

use crate::alert::{AlertLevel, MaintenanceWindow};
use crate::api::auth::Permission;
use crate::api::error::{ApiError, ParamErrorCode};
use crate::api::{
    parse_interval, parse_pagination, parse_time_range, success, ApiState,
};
use crate::count::{parse_record, Resolution};
use crate::decoder::Category;
use crate::unix_now;

type Params = Query<HashMap<String, String>>;

fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str)
}

/// Union of every category's family keys, plus the total counter
async fn monitored_keys(state: &ApiState) -> Result<Vec<String>, ApiError> {
    let mut keys = vec!["total".to_string()];
    for category in [
        Category::IpTraffic,
        Category::BvllTraffic,
        Category::NetworkTraffic,
        Category::ApplicationTraffic,
    ] {
        keys.extend(state.kv.smembers(category.set_name()).await?);
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

async fn current_total(state: &ApiState, key: &str) -> Result<i64, ApiError> {
    Ok(state
        .kv
        .get(key)
        .await?
        .and_then(|value| value.parse().ok())
        .unwrap_or(0))
}

/// Series samples for one key in chronological order, clamped to the range
async fn series_samples(
    state: &ApiState,
    key: &str,
    resolution: Resolution,
    start: u64,
    end: u64,
) -> Result<Vec<Value>, ApiError> {
    let series = format!("{}:{}", key, resolution.label());
    let records = state.kv.lrange(&series, 0, -1).await?;

    let mut samples: Vec<Value> = records
        .iter()
        .filter_map(|record| parse_record(record))
        .filter(|bucket| bucket.ts >= start && bucket.ts <= end)
        .map(|bucket| json!({"ts": bucket.ts, "count": bucket.count}))
        .collect();
    samples.reverse();
    Ok(samples)
}

/// GET /api/status
pub async fn status(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    state
        .kv
        .ping()
        .await
        .map_err(|err| ApiError::Unavailable(format!("kv store unreachable: {}", err)))?;

    let keys = monitored_keys(&state).await?;
    let data = json!({
        "system": {
            "daemon_version": state.kv.get("daemon_version").await?,
            "startup_time": state.kv.get("startup_time").await?,
            "current_time": unix_now(),
        },
        "redis": { "connected": true },
        "monitoring": { "total_keys": keys.len() },
        "alerts": { "active_count": state.alerts.active_count().await },
        "services": {
            "redis": true,
            "anomaly_detection": true,
            "alerts": true,
        },
    });
    Ok(success(data))
}

/// GET /api/monitoring
pub async fn monitoring(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let now = unix_now();
    let resolution = parse_interval(param(&params, "interval"))?;
    let (start, end) = parse_time_range(
        param(&params, "range"),
        param(&params, "start"),
        param(&params, "end"),
        now,
    )?;
    let (limit, offset) = parse_pagination(param(&params, "limit"), param(&params, "offset"))?;

    let all_keys = monitored_keys(&state).await?;
    let total_available = all_keys.len();

    let filters: Vec<&str> = param(&params, "keys")
        .map(|keys| keys.split(',').filter(|f| !f.is_empty()).collect())
        .unwrap_or_default();
    let selected: Vec<String> = all_keys
        .into_iter()
        .filter(|key| filters.is_empty() || filters.iter().any(|f| key.contains(f)))
        .skip(offset)
        .take(limit)
        .collect();

    let mut data = Map::new();
    for key in &selected {
        let samples = series_samples(&state, key, resolution, start, end).await?;
        let sample_count = samples.len();
        // bound the payload to the most recent samples
        let samples: Vec<Value> = samples
            .into_iter()
            .rev()
            .take(100)
            .rev()
            .collect();
        data.insert(
            key.clone(),
            json!({
                "current": current_total(&state, key).await?,
                "interval": resolution.label(),
                "samples": samples,
                "sample_count": sample_count,
            }),
        );
    }

    Ok(success(json!({
        "keys": selected,
        "total_available": total_available,
        "interval": resolution.label(),
        "data": data,
        "time_range": { "start": start, "end": end },
    })))
}

/// GET /api/traffic
pub async fn traffic(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let requested = param(&params, "type").unwrap_or("all");
    let categories: Vec<Category> = match requested {
        "all" => Category::all().to_vec(),
        name => vec![Category::from_name(name).ok_or_else(|| {
            ApiError::BadRequest(
                ParamErrorCode::BadValue,
                format!("invalid traffic type: {}", name),
            )
        })?],
    };

    let mut data = Map::new();
    for category in categories {
        let members = state.kv.smembers(category.set_name()).await?;

        let mut totals = Map::new();
        if category != Category::ErrorTraffic {
            for key in members.iter().take(100) {
                totals.insert(key.clone(), json!(current_total(&state, key).await?));
            }
        }

        data.insert(
            category.set_name().to_string(),
            json!({
                "count": members.len(),
                "keys": members,
                "totals": totals,
            }),
        );
    }

    Ok(success(Value::Object(data)))
}

/// GET /api/devices: devices announced through I-Am
pub async fn devices(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let mut devices = Vec::new();
    for key in state
        .kv
        .smembers(Category::ApplicationTraffic.set_name())
        .await?
    {
        let parts: Vec<&str> = key.split(',').collect();
        if parts.len() == 3 && parts[0] == "IAmRequest" {
            devices.push(json!({
                "address": parts[1],
                "device_instance": parts[2].parse::<u64>().ok(),
                "total": current_total(&state, &key).await?,
            }));
        }
    }

    Ok(success(json!({
        "count": devices.len(),
        "devices": devices,
    })))
}

/// GET /api/anomalies
pub async fn anomalies(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let now = unix_now();
    let (start, end) = parse_time_range(
        param(&params, "range"),
        param(&params, "start"),
        param(&params, "end"),
        now,
    )?;

    let min_score = match param(&params, "severity") {
        None | Some("low") => 0.0,
        Some("medium") => 0.5,
        Some("high") => 0.8,
        Some(other) => {
            return Err(ApiError::BadRequest(
                ParamErrorCode::BadValue,
                format!("invalid severity: {}", other),
            ))
        }
    };

    let anomaly_keys: Vec<String> = match param(&params, "key") {
        Some(key) => vec![format!("{}:anomalies", key)],
        None => state.kv.scan_keys("*:anomalies").await?,
    };

    let mut data = Map::new();
    for anomaly_key in anomaly_keys {
        let records = state.kv.lrange(&anomaly_key, 0, -1).await?;
        let entries: Vec<Value> = records
            .iter()
            .filter_map(|record| serde_json::from_str::<Value>(record).ok())
            .filter(|entry| {
                let ts = entry["ts"].as_u64().unwrap_or(0);
                let score = entry["score"].as_f64().unwrap_or(0.0);
                ts >= start && ts <= end && score >= min_score
            })
            .collect();
        if !entries.is_empty() {
            let key = anomaly_key.trim_end_matches(":anomalies").to_string();
            data.insert(key, Value::Array(entries));
        }
    }

    Ok(success(Value::Object(data)))
}

fn parse_min_level(value: Option<&str>) -> Result<AlertLevel, ApiError> {
    match value {
        None => Ok(AlertLevel::Warning),
        Some(name) => AlertLevel::parse(name).ok_or_else(|| {
            ApiError::BadRequest(
                ParamErrorCode::BadValue,
                format!("invalid alert level: {}", name),
            )
        }),
    }
}

/// GET /api/alerts
pub async fn alerts(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let min_level = parse_min_level(param(&params, "min_level"))?;
    let (limit, offset) = parse_pagination(param(&params, "limit"), param(&params, "offset"))?;

    let active = state.alerts.active_alerts(min_level).await;
    let total = active.len();
    let page: Vec<Value> = active
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|alert| serde_json::to_value(alert).unwrap_or(Value::Null))
        .collect();

    Ok(success(json!({
        "count": page.len(),
        "total": total,
        "alerts": page,
    })))
}

/// GET /api/alerts/history
pub async fn alert_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let min_level = parse_min_level(param(&params, "min_level"))?;
    let (limit, offset) = parse_pagination(param(&params, "limit"), param(&params, "offset"))?;

    let history = state.alerts.history(min_level, limit, offset).await;
    let alerts: Vec<Value> = history
        .into_iter()
        .map(|alert| serde_json::to_value(alert).unwrap_or(Value::Null))
        .collect();

    Ok(success(json!({
        "count": alerts.len(),
        "alerts": alerts,
    })))
}

/// GET /api/alerts/{uuid}
pub async fn alert(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let alert = state
        .alerts
        .get(&uuid)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown alert: {}", uuid)))?;
    Ok(success(serde_json::to_value(alert).unwrap_or(Value::Null)))
}

/// POST /api/alerts/{uuid}/acknowledge
pub async fn acknowledge(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Admin)?;

    if state.alerts.acknowledge(&uuid).await {
        Ok(success(json!({"uuid": uuid, "acknowledged": true})))
    } else {
        Err(ApiError::NotFound(format!("unknown alert: {}", uuid)))
    }
}

/// POST /api/alerts/{uuid}/resolve
pub async fn resolve(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Admin)?;

    if state.alerts.resolve(&uuid).await {
        Ok(success(json!({"uuid": uuid, "resolved": true})))
    } else {
        Err(ApiError::NotFound(format!("unknown alert: {}", uuid)))
    }
}

/// POST /api/alerts/maintenance
pub async fn create_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Admin)?;

    let name = body["name"]
        .as_str()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            ApiError::BadRequest(ParamErrorCode::MissingRequired, "name is required".to_string())
        })?;
    let start_time = body["start_time"].as_u64().ok_or_else(|| {
        ApiError::BadRequest(
            ParamErrorCode::MissingRequired,
            "start_time is required".to_string(),
        )
    })?;
    let end_time = body["end_time"].as_u64().ok_or_else(|| {
        ApiError::BadRequest(
            ParamErrorCode::MissingRequired,
            "end_time is required".to_string(),
        )
    })?;
    if end_time < start_time {
        return Err(ApiError::BadRequest(
            ParamErrorCode::BadTimeRange,
            "end_time is before start_time".to_string(),
        ));
    }

    let patterns = |field: &str| -> Vec<String> {
        body[field]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|value| value.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let window = MaintenanceWindow {
        name: name.to_string(),
        start_time,
        end_time,
        entity_patterns: patterns("entity_patterns"),
        key_patterns: patterns("key_patterns"),
    };
    state.alerts.add_maintenance_window(window.clone()).await;

    Ok(success(serde_json::to_value(window).unwrap_or(Value::Null)))
}

/// POST /api/alerts/maintenance/delete
pub async fn delete_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Admin)?;

    let name = body["name"].as_str().ok_or_else(|| {
        ApiError::BadRequest(ParamErrorCode::MissingRequired, "name is required".to_string())
    })?;

    if state.alerts.remove_maintenance_window(name).await {
        Ok(success(json!({"name": name, "removed": true})))
    } else {
        Err(ApiError::NotFound(format!(
            "unknown maintenance window: {}",
            name
        )))
    }
}

/// GET /api/export: raw JSON or CSV download, outside the envelope
pub async fn export(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Result<Response, ApiError> {
    state.auth.authorize(&headers, Permission::Read)?;

    let format = param(&params, "format").unwrap_or("json");
    if !["json", "csv"].contains(&format) {
        return Err(ApiError::BadRequest(
            ParamErrorCode::BadValue,
            format!("invalid format: {}", format),
        ));
    }

    let now = unix_now();
    let (start, end) = parse_time_range(
        param(&params, "range"),
        param(&params, "start"),
        param(&params, "end"),
        now,
    )?;

    match param(&params, "type").unwrap_or("monitoring") {
        "monitoring" => {
            let resolution = parse_interval(param(&params, "interval"))?;
            let filters: Vec<&str> = param(&params, "keys")
                .map(|keys| keys.split(',').filter(|f| !f.is_empty()).collect())
                .unwrap_or_default();
            let keys: Vec<String> = monitored_keys(&state)
                .await?
                .into_iter()
                .filter(|key| filters.is_empty() || filters.iter().any(|f| key.contains(f)))
                .collect();

            if format == "csv" {
                let mut csv = String::from("key,timestamp,count\n");
                for key in &keys {
                    for sample in series_samples(&state, key, resolution, start, end).await? {
                        csv.push_str(&format!(
                            "{},{},{}\n",
                            key, sample["ts"], sample["count"]
                        ));
                    }
                }
                Ok(csv_response("monitoring.csv", csv))
            } else {
                let mut data = Map::new();
                for key in &keys {
                    let samples = series_samples(&state, key, resolution, start, end).await?;
                    data.insert(key.clone(), Value::Array(samples));
                }
                Ok(Json(Value::Object(data)).into_response())
            }
        }
        "alerts" => {
            let mut alerts = state.alerts.active_alerts(AlertLevel::Debug).await;
            alerts.extend(state.alerts.history(AlertLevel::Debug, usize::MAX, 0).await);
            alerts.retain(|alert| alert.timestamp >= start && alert.timestamp <= end);

            if format == "csv" {
                let mut csv =
                    String::from("uuid,key,entity,level,timestamp,resolved,message\n");
                for alert in &alerts {
                    csv.push_str(&format!(
                        "{},{},{},{},{},{},{}\n",
                        alert.uuid,
                        alert.key,
                        alert.entity.as_deref().unwrap_or("-"),
                        alert.level.as_str(),
                        alert.timestamp,
                        alert.resolved,
                        alert.message.replace(',', ";"),
                    ));
                }
                Ok(csv_response("alerts.csv", csv))
            } else {
                Ok(Json(serde_json::to_value(alerts).unwrap_or(Value::Null)).into_response())
            }
        }
        other => Err(ApiError::BadRequest(
            ParamErrorCode::BadValue,
            format!("invalid export type: {}", other),
        )),
    }
}

fn csv_response(filename: &str, csv: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", filename),
            ),
        ],
        csv,
    )
        .into_response()
}

/// GET /clear/{set},{key}: drop a family key and all of its state
pub async fn clear(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(target): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize(&headers, Permission::Admin)?;

    let (set_name, key) = target.split_once(',').ok_or_else(|| {
        ApiError::BadRequest(
            ParamErrorCode::BadValue,
            "expected {set},{key}".to_string(),
        )
    })?;
    let category = Category::from_name(set_name).ok_or_else(|| {
        ApiError::BadRequest(
            ParamErrorCode::InvalidName,
            format!("unknown set: {}", set_name),
        )
    })?;

    let removed = state.kv.srem(category.set_name(), key).await?;

    state.kv.delete(key).await?;
    for resolution in Resolution::all() {
        let series = format!("{}:{}", key, resolution.label());
        state.kv.delete(&series).await?;
        state.kv.delete(&format!("{}i", series)).await?;
        state.kv.delete(&format!("{}n", series)).await?;
    }
    state.kv.delete(&format!("{}:alarm", key)).await?;
    state.kv.delete(&format!("{}:alarm-history", key)).await?;
    state.kv.delete(&format!("{}:anomalies", key)).await?;

    Ok(success(json!({
        "set": category.set_name(),
        "key": key,
        "removed": removed,
    })))
}
