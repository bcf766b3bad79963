//! Gateway error classification.

use std::time::Duration;

use reqwest::StatusCode;

use crate::ratelimit::RateLimitState;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Errors surfaced by gateway requests.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// 429 or exhausted quota headers. `retry_after` is the server's hint
    /// when it sent one.
    #[error("rate limited by gateway{}", retry_hint(.retry_after))]
    RateLimited {
        retry_after: Option<Duration>,
        state: RateLimitState,
    },

    /// 402: the account balance cannot cover the request.
    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    /// 401: the API key was rejected.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Any other non-success status.
    #[error("gateway returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GatewayError {
    /// Whether a retry with backoff can plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Api { status, .. } => status.is_server_error(),
            Self::Transport(e) => e.is_connect() || e.is_timeout(),
            Self::InsufficientCredits(_) | Self::InvalidCredentials(_) => false,
        }
    }
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

/// Map a non-success response to a [`GatewayError`], consuming at most
/// 32 KiB of the body. `state` is the quota snapshot already parsed from
/// this response's headers.
pub async fn classify_error_response(
    response: reqwest::Response,
    state: RateLimitState,
) -> GatewayError {
    let status = response.status();
    let retry_after = state.retry_after_secs.map(Duration::from_secs);
    let body = read_capped_error_body(response).await;
    let message = extract_error_message(&body);

    match status {
        StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited { retry_after, state },
        StatusCode::PAYMENT_REQUIRED => GatewayError::InsufficientCredits(message),
        StatusCode::UNAUTHORIZED => GatewayError::InvalidCredentials(message),
        _ => GatewayError::Api { status, message },
    }
}

/// Pull a human-readable message out of a gateway error body, falling
/// back to the raw (capped) body when it is not the expected JSON shape.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

pub(crate) async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_nested_error_message() {
        let body = r#"{"error":{"message":"Model not found","code":404}}"#;
        assert_eq!(extract_error_message(body), "Model not found");
    }

    #[test]
    fn falls_back_to_raw_body() {
        assert_eq!(extract_error_message("upstream exploded"), "upstream exploded");
        assert_eq!(extract_error_message(r#"{"detail":"nope"}"#), r#"{"detail":"nope"}"#);
    }

    #[test]
    fn retryability() {
        let rate_limited = GatewayError::RateLimited {
            retry_after: None,
            state: RateLimitState::default(),
        };
        assert!(rate_limited.is_retryable());

        let server = GatewayError::Api {
            status: StatusCode::BAD_GATEWAY,
            message: String::new(),
        };
        assert!(server.is_retryable());

        let client = GatewayError::Api {
            status: StatusCode::BAD_REQUEST,
            message: String::new(),
        };
        assert!(!client.is_retryable());

        assert!(!GatewayError::InvalidCredentials(String::new()).is_retryable());
        assert!(!GatewayError::InsufficientCredits(String::new()).is_retryable());
    }

    #[test]
    fn rate_limited_display_includes_hint() {
        let err = GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
            state: RateLimitState::default(),
        };
        assert_eq!(err.to_string(), "rate limited by gateway (retry after 12s)");
    }
}
