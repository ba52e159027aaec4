//! REST / Streaming API
//!
//! Read-only queries over the counters and family sets, a small set of
//! mutating alert endpoints, and the v2 SSE streams. Every response uses
//! the standard envelope:
//!
//! ```json
//! { "status": "success", "timestamp": 1700000000,
//!   "version": "0.3.0", "code": 200, "data": { } }
//! ```
//!
//! Versioning is path-prefixed (`/api/`, `/api/v1/`, `/api/v2/`; the bare
//! prefix aliases v1) and may also be negotiated through
//! `Accept: application/vnd.bacmon.v<n>+json`.

pub mod auth;
pub mod error;
pub mod v1;
pub mod v2;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::alert::AlertManager;
use crate::api::error::{ApiError, ParamErrorCode};
use crate::config::BacmonConfig;
use crate::count::Resolution;
use crate::kv::KvStore;
use crate::unix_now;

/// Shared state for every handler
#[derive(Clone)]
pub struct ApiState {
    pub kv: Arc<dyn KvStore>,
    pub alerts: Arc<AlertManager>,
    pub auth: Arc<auth::AuthProvider>,
    pub config: Arc<BacmonConfig>,
}

impl ApiState {
    pub fn new(kv: Arc<dyn KvStore>, alerts: Arc<AlertManager>, config: BacmonConfig) -> Self {
        let auth = Arc::new(auth::AuthProvider::from_config(&config.api));
        ApiState {
            kv,
            alerts,
            auth,
            config: Arc::new(config),
        }
    }
}

/// Wrap a payload in the success envelope
pub fn success(data: Value) -> Json<Value> {
    Json(json!({
        "status": "success",
        "timestamp": unix_now(),
        "version": env!("CARGO_PKG_VERSION"),
        "code": 200,
        "data": data,
    }))
}

/// API major version selected by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

/// Version negotiated from the `Accept` header
/// (`application/vnd.bacmon.v<n>+json`); path prefixes take precedence and
/// unversioned media types fall back to v1.
pub fn negotiated_version(headers: &HeaderMap) -> ApiVersion {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if accept
        .split(',')
        .any(|media| media.trim().starts_with("application/vnd.bacmon.v2+json"))
    {
        ApiVersion::V2
    } else {
        ApiVersion::V1
    }
}

/// Parse `interval=s|m|h`
pub fn parse_interval(value: Option<&str>) -> Result<Resolution, ApiError> {
    let label = value.unwrap_or("s");
    Resolution::from_label(label).ok_or_else(|| {
        ApiError::BadRequest(
            ParamErrorCode::BadValue,
            format!("invalid interval: {}", label),
        )
    })
}

/// Resolve the `(start, end)` window from `range=1h|6h|24h|7d` or explicit
/// `start`/`end` timestamps, which take precedence.
pub fn parse_time_range(
    range: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
    now: u64,
) -> Result<(u64, u64), ApiError> {
    let parse_ts = |value: &str| -> Result<u64, ApiError> {
        value.parse().map_err(|_| {
            ApiError::BadRequest(
                ParamErrorCode::BadTimeRange,
                format!("invalid timestamp: {}", value),
            )
        })
    };

    if start.is_some() || end.is_some() {
        let end = match end {
            Some(value) => parse_ts(value)?,
            None => now,
        };
        let start = match start {
            Some(value) => parse_ts(value)?,
            None => end.saturating_sub(3600),
        };
        if start > end {
            return Err(ApiError::BadRequest(
                ParamErrorCode::BadTimeRange,
                "start is after end".to_string(),
            ));
        }
        return Ok((start, end));
    }

    let span = match range.unwrap_or("1h") {
        "1h" => 3600,
        "6h" => 6 * 3600,
        "24h" => 24 * 3600,
        "7d" => 7 * 24 * 3600,
        other => {
            return Err(ApiError::BadRequest(
                ParamErrorCode::BadTimeRange,
                format!("invalid range: {}", other),
            ))
        }
    };
    Ok((now.saturating_sub(span), now))
}

/// Parse `limit`/`offset` pagination; limit is clamped to 1..=1000
pub fn parse_pagination(
    limit: Option<&str>,
    offset: Option<&str>,
) -> Result<(usize, usize), ApiError> {
    let bad = |which: &str, value: &str| {
        ApiError::BadRequest(
            ParamErrorCode::BadPagination,
            format!("invalid {}: {}", which, value),
        )
    };

    let limit = match limit {
        Some(value) => {
            let parsed: usize = value.parse().map_err(|_| bad("limit", value))?;
            if parsed == 0 || parsed > 1000 {
                return Err(bad("limit", value));
            }
            parsed
        }
        None => 50,
    };
    let offset = match offset {
        Some(value) => value.parse().map_err(|_| bad("offset", value))?,
        None => 0,
    };
    Ok((limit, offset))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("unknown endpoint".to_string())
}

fn versioned_routes() -> Router<ApiState> {
    Router::new()
        .route("/status", get(v1::status))
        .route("/monitoring", get(v1::monitoring))
        .route("/traffic", get(v1::traffic))
        .route("/devices", get(v1::devices))
        .route("/anomalies", get(v1::anomalies))
        .route("/alerts", get(v1::alerts))
        .route("/alerts/history", get(v1::alert_history))
        .route("/alerts/maintenance", post(v1::create_maintenance))
        .route("/alerts/maintenance/delete", post(v1::delete_maintenance))
        .route("/alerts/:uuid", get(v1::alert))
        .route("/alerts/:uuid/acknowledge", post(v1::acknowledge))
        .route("/alerts/:uuid/resolve", post(v1::resolve))
        .route("/export", get(v1::export))
}

/// Assemble the full router
pub fn router(state: ApiState) -> Router {
    let v2 = versioned_routes()
        .route("/monitoring/stream", get(v2::monitoring_stream))
        .route("/alerts/stream", get(v2::alerts_stream))
        .route("/data/aggregate", get(v2::aggregate));

    Router::new()
        .nest("/api/v1", versioned_routes())
        .nest("/api/v2", v2)
        .nest("/api", versioned_routes())
        .route("/clear/:target", get(v1::clear))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is interrupted
pub async fn serve(state: ApiState, bind: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
