//! Error taxonomy mapped onto the concrete HTTP status/error-kind pairs the
//! broker surface promises. Deny messages never disclose secret names,
//! values, or other agents' grants.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    InvalidToken,
    CapabilityMissing,
    ScopeViolation,
    ExpiredScope,
    BadHeader(String),
    BadProvider(String),
    BadPath(String),
    UnknownProvider(String),
    RequestTimeout,
    UpstreamError(String),
    UpstreamSaturated,
    UpstreamTimeout,
    Internal(String),
    PolicyDenial { reason: String, suggestion: Option<String> },
    ScopeExceedsGrants,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<String>) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token".into(), None),
            ApiError::InvalidToken => (StatusCode::FORBIDDEN, "invalid_token", "bearer token is invalid or unknown".into(), None),
            ApiError::CapabilityMissing => (StatusCode::FORBIDDEN, "capability_missing", "agent is not entitled to this endpoint".into(), None),
            ApiError::ScopeViolation => (StatusCode::FORBIDDEN, "scope_violation", "scoped token does not cover this endpoint".into(), None),
            ApiError::ExpiredScope => (StatusCode::FORBIDDEN, "expired_scope", "scoped token has expired".into(), None),
            ApiError::BadHeader(m) => (StatusCode::BAD_REQUEST, "bad_header", m.clone(), None),
            ApiError::BadProvider(m) => (StatusCode::BAD_REQUEST, "bad_provider", m.clone(), None),
            ApiError::BadPath(m) => (StatusCode::BAD_REQUEST, "bad_path", m.clone(), None),
            ApiError::UnknownProvider(p) => (StatusCode::NOT_FOUND, "unknown_provider", format!("no route for provider {p}"), None),
            ApiError::RequestTimeout => (StatusCode::REQUEST_TIMEOUT, "request_timeout", "inbound deadline exceeded".into(), None),
            ApiError::UpstreamError(m) => (StatusCode::BAD_GATEWAY, "upstream_error", m.clone(), None),
            ApiError::UpstreamSaturated => (StatusCode::SERVICE_UNAVAILABLE, "upstream_saturated", "too many concurrent calls to this provider".into(), None),
            ApiError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", "upstream exceeded its time budget".into(), None),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m.clone(), None),
            ApiError::PolicyDenial { reason, suggestion } => {
                (StatusCode::FORBIDDEN, "policy_denial", reason.clone(), suggestion.clone())
            }
            ApiError::ScopeExceedsGrants => (
                StatusCode::FORBIDDEN,
                "scope_exceeds_grants",
                "requested capabilities exceed the agent's grants".into(),
                None,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind, message, suggestion) = self.parts();
        (status, Json(ErrorBody { error: kind, message, suggestion })).into_response()
    }
}
