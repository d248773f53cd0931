//! Response envelope and error-to-status mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nlb_autoscale::AutoscaleError;
use nlb_core::Protocol;
use nlb_ratelimit::RateLimitError;
use nlb_rollout::RolloutError;
use nlb_router::RouterError;
use serde::Serialize;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// An error rendered as the envelope with `success: false`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(self.message),
            }),
        )
            .into_response()
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        let status = match &e {
            RouterError::NoBackendAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::DuplicateRegistration { .. } => StatusCode::CONFLICT,
            RouterError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            RouterError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<RolloutError> for ApiError {
    fn from(e: RolloutError) -> Self {
        let status = match &e {
            RolloutError::NotInitialized(_) => StatusCode::NOT_FOUND,
            RolloutError::AlreadyTransitioning(_) | RolloutError::NotTransitioning(_) => {
                StatusCode::CONFLICT
            }
            RolloutError::InvalidWeightConfiguration { .. }
            | RolloutError::UnknownVersion { .. }
            | RolloutError::InvalidVersions(_)
            | RolloutError::InvalidSteps(_) => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<AutoscaleError> for ApiError {
    fn from(e: AutoscaleError) -> Self {
        let status = match &e {
            AutoscaleError::UnknownPolicy(_) => StatusCode::NOT_FOUND,
            AutoscaleError::InvalidPolicy(_) | AutoscaleError::PolicyViolation { .. } => {
                StatusCode::BAD_REQUEST
            }
            AutoscaleError::CoolingDown { .. } | AutoscaleError::NoChange { .. } => {
                StatusCode::CONFLICT
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        let status = match &e {
            RateLimitError::Exceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RateLimitError::MissingPolicy(_) => StatusCode::NOT_FOUND,
            RateLimitError::InvalidBucket { .. } | RateLimitError::InvalidAmount(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        Self::new(status, e.to_string())
    }
}

/// Parse a protocol path segment, accepting the usual aliases.
pub fn parse_protocol(raw: &str) -> Result<Protocol, ApiError> {
    raw.parse::<Protocol>()
        .map_err(|_| ApiError::bad_request(format!("unknown protocol: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases: [(ApiError, StatusCode); 6] = [
            (
                RouterError::NoBackendAvailable(Protocol::Http).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RouterError::UnknownInstance("x".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                RolloutError::InvalidWeightConfiguration { blue: 1, green: 1 }.into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                RolloutError::AlreadyTransitioning(Protocol::Http).into(),
                StatusCode::CONFLICT,
            ),
            (
                AutoscaleError::UnknownPolicy(Protocol::Redis).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                RateLimitError::Exceeded {
                    key: "k".into(),
                    requested: 1.0,
                    available: 0.0,
                }
                .into(),
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status, status, "{}", err.message);
        }
    }

    #[test]
    fn parse_protocol_aliases() {
        assert_eq!(parse_protocol("pg").unwrap(), Protocol::Postgres);
        assert_eq!(
            parse_protocol("smtp").unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn envelope_shape() {
        let Json(ok) = ApiResponse::ok(5);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": 5}));
    }
}
