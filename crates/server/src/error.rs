use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Structured failures a request handler can raise. The `IntoResponse`
/// impl is the JSON boundary: every failure leaves the process as
/// `{"message": <reason>, ...extra}` with the matching status, and nothing
/// else (no stack traces, no framework error pages).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{message}")]
    Forbidden {
        message: String,
        extra: Map<String, Value>,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict {
        message: String,
        extra: Map<String, Value>,
    },
    #[error("Too many requests")]
    TooManyRequests { interval: u64 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>, extra: Map<String, Value>) -> Self {
        Self::Forbidden {
            message: message.into(),
            extra,
        }
    }

    pub fn conflict(message: impl Into<String>, extra: Map<String, Value>) -> Self {
        Self::Conflict {
            message: message.into(),
            extra,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, extra, retry_after) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message, Map::new(), None),
            ApiError::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, message, Map::new(), None)
            }
            ApiError::Forbidden { message, extra } => {
                (StatusCode::FORBIDDEN, message, extra, None)
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message, Map::new(), None),
            ApiError::Conflict { message, extra } => {
                (StatusCode::CONFLICT, message, extra, None)
            }
            ApiError::TooManyRequests { interval } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests".to_string(),
                Map::new(),
                Some(interval),
            ),
            ApiError::Internal(error) => {
                tracing::error!("An error occurred whilst processing a request: {error:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Map::new(),
                    None,
                )
            }
        };

        let mut body = Map::new();
        body.insert(
            "message".to_string(),
            json!(message.trim_end_matches('.')),
        );
        body.extend(extra);

        let mut response = (status, Json(Value::Object(body))).into_response();
        if let Some(interval) = retry_after
            && let Ok(value) = HeaderValue::from_str(&interval.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
