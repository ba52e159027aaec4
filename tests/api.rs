//! API surface tests: envelope shape, validation codes, auth enforcement
//! and the mutating alert endpoints, driven through the router with
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use bacmon::alert::{AlertLevel, AlertManager, RateLimit};
use bacmon::api::{router, ApiState};
use bacmon::config::{ApiKeyConfig, BacmonConfig};
use bacmon::kv::{KvStore, MemoryKv};
use bacmon::unix_now;

struct Harness {
    kv: Arc<MemoryKv>,
    alerts: Arc<AlertManager>,
    router: axum::Router,
}

fn harness(with_auth: bool) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let alerts = Arc::new(AlertManager::new(
        kv.clone(),
        Vec::new(),
        RateLimit::default(),
    ));

    let mut config = BacmonConfig::default();
    if with_auth {
        config.api.keys = vec![
            ApiKeyConfig {
                key: "reader".to_string(),
                permissions: vec!["read".to_string()],
            },
            ApiKeyConfig {
                key: "operator".to_string(),
                permissions: vec!["read".to_string(), "admin".to_string()],
            },
        ];
    }

    let state = ApiState::new(kv.clone(), alerts.clone(), config);
    Harness {
        kv,
        alerts,
        router: router(state),
    }
}

async fn get(harness: &Harness, uri: &str, api_key: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let response = harness
        .router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn post(
    harness: &Harness,
    uri: &str,
    api_key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method("POST").uri(uri);
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = harness.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn status_uses_success_envelope() {
    let harness = harness(false);
    let (status, body) = get(&harness, "/api/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("success"));
    assert_eq!(body["code"], json!(200));
    assert!(body["timestamp"].as_u64().is_some());
    assert!(body["version"].as_str().is_some());
    assert!(body["data"]["services"]["redis"].as_bool().unwrap());
}

#[tokio::test]
async fn monitoring_returns_series_samples() {
    let harness = harness(false);
    let now = unix_now();
    let sample_ts = now - 1;

    harness.kv.sadd("application-traffic", "K").await.unwrap();
    harness
        .kv
        .lpush("K:s", &bacmon::count::format_record(sample_ts, 1))
        .await
        .unwrap();
    harness.kv.set("K", "1").await.unwrap();

    let (status, body) = get(
        &harness,
        "/api/v2/monitoring?keys=K&interval=s&range=1h",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["data"]["K"]["samples"][0]["ts"], json!(sample_ts));
    assert_eq!(body["data"]["data"]["K"]["current"], json!(1));
}

#[tokio::test]
async fn invalid_range_maps_to_4004() {
    let harness = harness(false);
    let (status, body) = get(&harness, "/api/monitoring?range=invalid", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], json!("error"));
    assert_eq!(body["error_code"], json!(4004));
    assert!(body["error"].as_str().unwrap().contains("range"));
}

#[tokio::test]
async fn invalid_pagination_maps_to_4005() {
    let harness = harness(false);
    let (status, body) = get(&harness, "/api/monitoring?limit=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], json!(4005));
}

#[tokio::test]
async fn auth_is_enforced_when_keys_configured() {
    let harness = harness(true);

    let (status, body) = get(&harness, "/api/status", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], json!("error"));

    let (status, _) = get(&harness, "/api/status", Some("reader")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = get(&harness, "/api/status", Some("bogus")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mutating_endpoints_require_admin() {
    let harness = harness(true);
    let alert = harness
        .alerts
        .create(
            "rate-anomaly",
            "Rate exceeded",
            AlertLevel::Warning,
            "rate-monitor",
            Some("K:s".to_string()),
            serde_json::Map::new(),
            unix_now(),
        )
        .await
        .unwrap();

    let uri = format!("/api/alerts/{}/resolve", alert.uuid);
    let (status, _) = post(&harness, &uri, Some("reader"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = post(&harness, &uri, Some("operator"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["resolved"], json!(true));

    // resolve is idempotent at the manager level: the second call is a 404
    let (status, _) = post(&harness, &uri, Some("operator"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn alert_listing_and_lookup() {
    let harness = harness(false);
    let alert = harness
        .alerts
        .create(
            "rate-anomaly",
            "Rate exceeded",
            AlertLevel::Alert,
            "rate-monitor",
            Some("K:s".to_string()),
            serde_json::Map::new(),
            unix_now(),
        )
        .await
        .unwrap();

    let (status, body) = get(&harness, "/api/alerts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], json!(1));

    let (status, body) = get(&harness, &format!("/api/alerts/{}", alert.uuid), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["uuid"], json!(alert.uuid));

    let (status, _) = get(&harness, "/api/alerts/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn maintenance_window_crud() {
    let harness = harness(false);

    let (status, body) = post(
        &harness,
        "/api/alerts/maintenance",
        None,
        Some(json!({
            "name": "patching",
            "start_time": 100,
            "end_time": 200,
            "entity_patterns": ["K"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], json!("patching"));

    // missing name is a 4002
    let (status, body) = post(
        &harness,
        "/api/alerts/maintenance",
        None,
        Some(json!({"start_time": 1, "end_time": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], json!(4002));

    let (status, _) = post(
        &harness,
        "/api/alerts/maintenance/delete",
        None,
        Some(json!({"name": "patching"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(
        &harness,
        "/api/alerts/maintenance/delete",
        None,
        Some(json!({"name": "patching"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn clear_drops_family_key_state() {
    let harness = harness(false);
    harness.kv.sadd("application-traffic", "K").await.unwrap();
    harness.kv.set("K", "5").await.unwrap();
    harness.kv.lpush("K:s", "[100, 5]").await.unwrap();
    harness.kv.set("K:si", "100").await.unwrap();

    let (status, body) = get(&harness, "/clear/application-traffic,K", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["removed"], json!(true));

    assert!(harness.kv.smembers("application-traffic").await.unwrap().is_empty());
    assert!(!harness.kv.exists("K").await.unwrap());
    assert!(!harness.kv.exists("K:s").await.unwrap());
    assert!(!harness.kv.exists("K:si").await.unwrap());
}

#[tokio::test]
async fn clear_rejects_unknown_set() {
    let harness = harness(false);
    let (status, body) = get(&harness, "/clear/no-such-set,K", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], json!(4001));
}

#[tokio::test]
async fn aggregate_applies_function_per_window() {
    let harness = harness(false);
    let now = unix_now();
    let base = now - (now % 60) - 120;

    for (offset, count) in [(0u64, 2u64), (1, 4), (60, 10)] {
        harness
            .kv
            .lpush("K:s", &bacmon::count::format_record(base + offset, count))
            .await
            .unwrap();
    }

    let uri = format!(
        "/api/v2/data/aggregate?keys=K&function=sum&window=60&start={}&end={}",
        base,
        base + 119,
    );
    let (status, body) = get(&harness, &uri, None).await;

    assert_eq!(status, StatusCode::OK);
    let windows = body["data"]["data"]["K"].as_array().unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0]["value"], json!(6.0));
    assert_eq!(windows[1]["value"], json!(10.0));
}

#[tokio::test]
async fn aggregate_requires_keys() {
    let harness = harness(false);
    let (status, body) = get(
        &harness,
        "/api/v2/data/aggregate?function=avg&window=60",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], json!(4002));
}

#[tokio::test]
async fn unknown_endpoint_is_an_enveloped_404() {
    let harness = harness(false);
    let (status, body) = get(&harness, "/api/nonsense", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], json!("error"));
    assert_eq!(body["code"], json!(404));
}

#[tokio::test]
async fn traffic_rejects_unknown_type() {
    let harness = harness(false);
    let (status, body) = get(&harness, "/api/traffic?type=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], json!(4003));
}

#[tokio::test]
async fn export_csv_has_expected_header() {
    let harness = harness(false);
    harness.kv.sadd("application-traffic", "K").await.unwrap();
    let now = unix_now();
    harness
        .kv
        .lpush("K:s", &bacmon::count::format_record(now - 2, 3))
        .await
        .unwrap();

    let request = Request::builder()
        .uri("/api/export?format=csv&type=monitoring&keys=K&range=1h")
        .body(Body::empty())
        .unwrap();
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("key,timestamp,count\n"));
    assert!(text.contains("K,"));
}
