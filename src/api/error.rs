//! API Error Envelope
//!
//! Every failed request answers with the standard envelope; malformed
//! parameters additionally carry an `error_code` in the 4001-4005 range so
//! clients can distinguish validation failures without parsing messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::unix_now;

/// Parameter validation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ParamErrorCode {
    InvalidName = 4001,
    MissingRequired = 4002,
    BadValue = 4003,
    BadTimeRange = 4004,
    BadPagination = 4005,
}

/// Errors any API handler can return
#[derive(Debug)]
pub enum ApiError {
    /// 400 with a parameter error code
    BadRequest(ParamErrorCode, String),
    /// 401: no or unknown credentials
    Unauthorized(String),
    /// 403: authenticated but lacking the permission
    Forbidden(String),
    /// 404: unknown uuid, endpoint or key
    NotFound(String),
    /// 503: a subsystem (typically the KV store) is unavailable
    Unavailable(String),
    /// 500
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(..) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(_, message)
            | ApiError::Unauthorized(message)
            | ApiError::Forbidden(message)
            | ApiError::NotFound(message)
            | ApiError::Unavailable(message)
            | ApiError::Internal(message) => message,
        }
    }
}

impl From<crate::kv::KvError> for ApiError {
    fn from(err: crate::kv::KvError) -> Self {
        match err {
            crate::kv::KvError::Unavailable(message) => ApiError::Unavailable(message),
            crate::kv::KvError::Operation(message) => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "status": "error",
            "timestamp": unix_now(),
            "version": env!("CARGO_PKG_VERSION"),
            "code": status.as_u16(),
            "error": self.message(),
        });
        if let ApiError::BadRequest(code, _) = &self {
            body["error_code"] = json!(*code as u16);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_error_codes() {
        assert_eq!(ParamErrorCode::InvalidName as u16, 4001);
        assert_eq!(ParamErrorCode::BadTimeRange as u16, 4004);
        assert_eq!(ParamErrorCode::BadPagination as u16, 4005);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::BadRequest(ParamErrorCode::BadValue, "x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unavailable("kv down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
