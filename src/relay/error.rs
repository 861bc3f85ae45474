//! Relay error types.
//!
//! Every failure carries a status code and a message; the JSON body follows
//! the uniform `{"error":{code,message,details?}}` shape.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Phrase the upstream uses when a credential's own quota is spent. The
/// reservation is kept in that case: the tokens were consumed upstream.
pub const QUOTA_EXHAUSTED_MARKER: &str = "Resource has been exhausted";

#[derive(Debug, Clone)]
pub enum RelayError {
    /// Estimated tokens exceed a limiter's total capacity; rotation cannot help.
    RequestTooLarge(String),
    /// A limiter budget would be exceeded right now.
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },
    /// Authentication token missing or rejected.
    Unauthorized(String),
    /// Upstream returned a non-success status (HTTP or synthetic).
    Upstream { status: u16, message: String },
    /// Malformed request.
    InvalidRequest(String),
    /// Field-level validation failure.
    Validation { message: String, details: Vec<Value> },
    /// Upstream call timed out.
    Timeout(String),
    /// Anything else.
    Internal(String),
}

impl RelayError {
    pub fn status(&self) -> u16 {
        match self {
            RelayError::RequestTooLarge(_) => 429,
            RelayError::RateLimited { .. } => 429,
            RelayError::Unauthorized(_) => 401,
            RelayError::Upstream { status, .. } => *status,
            RelayError::InvalidRequest(_) => 400,
            RelayError::Validation { .. } => 422,
            RelayError::Timeout(_) => 504,
            RelayError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::RequestTooLarge(_) => "request_too_large",
            RelayError::RateLimited { .. } => "rate_limited",
            RelayError::Unauthorized(_) => "unauthorized",
            RelayError::Upstream { .. } => "upstream_error",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Validation { .. } => "validation_error",
            RelayError::Timeout(_) => "timeout",
            RelayError::Internal(_) => "internal_error",
        }
    }

    /// Whether rotating to another credential and retrying can help.
    /// `retry_timeouts` is set for idempotent operations only.
    pub fn is_retryable(&self, retryable_statuses: &[u16], retry_timeouts: bool) -> bool {
        match self {
            RelayError::Upstream { status, .. } => retryable_statuses.contains(status),
            RelayError::Timeout(_) => retry_timeouts,
            _ => false,
        }
    }

    /// Upstream quota exhaustion keeps the per-key reservation: the provider
    /// already counted the request against the credential.
    pub fn keeps_reservation(&self) -> bool {
        matches!(
            self,
            RelayError::Upstream { status: 429, message } if message.contains(QUOTA_EXHAUSTED_MARKER)
        )
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::RequestTooLarge(msg) => write!(f, "Request too large: {}", msg),
            RelayError::RateLimited { message, .. } => write!(f, "Rate limited: {}", message),
            RelayError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            RelayError::Upstream { status, message } => {
                write!(f, "Upstream returned {}: {}", status, message)
            }
            RelayError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            RelayError::Validation { message, .. } => write!(f, "Validation failed: {}", message),
            RelayError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string()
            }
        });
        if let RelayError::Validation { details, .. } = &self {
            body["error"]["details"] = Value::Array(details.clone());
        }

        crate::logger::error(
            "relay",
            &format!(
                "Returning error response: status={}, code={}, message={}",
                status.as_u16(),
                self.code(),
                self
            ),
        );

        let mut response = (status, Json(body)).into_response();
        if let RelayError::RateLimited {
            retry_after: Some(seconds),
            ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RelayError::RequestTooLarge("x".into()).status(), 429);
        assert_eq!(
            RelayError::RateLimited {
                message: "x".into(),
                retry_after: None
            }
            .status(),
            429
        );
        assert_eq!(
            RelayError::Upstream {
                status: 503,
                message: "x".into()
            }
            .status(),
            503
        );
        assert_eq!(RelayError::Validation { message: "x".into(), details: vec![] }.status(), 422);
        assert_eq!(RelayError::Timeout("x".into()).status(), 504);
        assert_eq!(RelayError::Internal("x".into()).status(), 500);
    }

    #[test]
    fn test_retryable_classification() {
        let retryable = vec![503];
        let upstream_503 = RelayError::Upstream {
            status: 503,
            message: "overloaded".into(),
        };
        let upstream_400 = RelayError::Upstream {
            status: 400,
            message: "bad".into(),
        };
        assert!(upstream_503.is_retryable(&retryable, false));
        assert!(!upstream_400.is_retryable(&retryable, false));
        assert!(!RelayError::Timeout("t".into()).is_retryable(&retryable, false));
        assert!(RelayError::Timeout("t".into()).is_retryable(&retryable, true));
        assert!(!RelayError::RequestTooLarge("t".into()).is_retryable(&retryable, true));
    }

    #[test]
    fn test_keeps_reservation_only_for_quota_exhaustion() {
        let quota = RelayError::Upstream {
            status: 429,
            message: "Resource has been exhausted (e.g. check quota).".into(),
        };
        let plain_429 = RelayError::Upstream {
            status: 429,
            message: "slow down".into(),
        };
        let local = RelayError::RateLimited {
            message: "budget".into(),
            retry_after: Some(10),
        };
        assert!(quota.keeps_reservation());
        assert!(!plain_429.keeps_reservation());
        assert!(!local.keeps_reservation());
    }
}
