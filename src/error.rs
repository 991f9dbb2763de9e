use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::ratelimit::RATE_LIMIT_EXCEEDED;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every rejection the gateway can hand back to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    RateLimited { retry_after_secs: u64, message: String },
    IpBlocked,
    /// Counter store down under a fail-closed policy.
    RateLimitUnavailable,
    LoginThrottled { retry_after_secs: u64 },
    UpstreamUnavailable,
    Upstream(String),
    PayloadTooLarge,
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => RATE_LIMIT_EXCEEDED,
            Self::IpBlocked => "IP_BLOCKED",
            Self::RateLimitUnavailable => "RATE_LIMIT_UNAVAILABLE",
            Self::LoginThrottled { .. } => "LOGIN_THROTTLED",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Human readable text; `None` where the body carries only the code.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::RateLimited { message, .. } => Some(message.clone()),
            Self::IpBlocked => Some("Access from your IP address has been blocked".to_string()),
            Self::RateLimitUnavailable => None,
            Self::LoginThrottled { .. } => {
                Some("Too many failed login attempts, please try again later".to_string())
            }
            Self::UpstreamUnavailable => Some("Upstream service unavailable".to_string()),
            Self::Upstream(msg) => Some(msg.clone()),
            Self::PayloadTooLarge => Some("Request body exceeds configured limit".to_string()),
            Self::Internal(msg) => Some(msg.clone()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } | Self::LoginThrottled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::IpBlocked => StatusCode::FORBIDDEN,
            Self::RateLimitUnavailable | Self::UpstreamUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs, .. }
            | Self::LoginThrottled { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{}: {message}", self.code()),
            None => f.write_str(self.code()),
        }
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after_secs();
        let mut response = (
            self.status(),
            Json(ErrorBody {
                success: false,
                error: self.code(),
                message: self.message(),
                retry_after,
            }),
        )
            .into_response();

        if let Some(secs) = retry_after
            && let Ok(v) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::UpstreamUnavailable
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::{Value, json};

    use super::*;

    async fn body_json(err: GatewayError) -> (StatusCode, Option<String>, Value) {
        let response = err.into_response();
        let status = response.status();
        let retry = response
            .headers()
            .get(header::RETRY_AFTER)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, retry, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn rate_limited_body_carries_retry_hint() {
        let (status, retry, body) = body_json(GatewayError::RateLimited {
            retry_after_secs: 42,
            message: "Too many requests, please try again later".to_string(),
        })
        .await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(retry.as_deref(), Some("42"));
        assert_eq!(
            body,
            json!({
                "success": false,
                "error": "RATE_LIMIT_EXCEEDED",
                "message": "Too many requests, please try again later",
                "retryAfter": 42
            })
        );
    }

    #[tokio::test]
    async fn blocked_and_unavailable_are_not_429s() {
        let (status, retry, body) = body_json(GatewayError::IpBlocked).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(retry, None);
        assert_eq!(body["error"], "IP_BLOCKED");
        assert!(body["message"].is_string());

        let (status, _, body) = body_json(GatewayError::RateLimitUnavailable).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"success": false, "error": "RATE_LIMIT_UNAVAILABLE"}));
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(
            GatewayError::Upstream("boom".to_string()).to_string(),
            "UPSTREAM_ERROR: boom"
        );
        assert_eq!(GatewayError::RateLimitUnavailable.to_string(), "RATE_LIMIT_UNAVAILABLE");
    }
}
