//! HTTP gateway client with streaming completion support.
//!
//! # Architecture
//!
//! The crate is organized around one client and four supporting concerns:
//!
//! - [`GatewayClient`] - Authenticated HTTP surface: streaming completions,
//!   generation resume/metadata, key validation
//! - [`sse`] - Line-buffered SSE decoding and the relay pump that feeds a
//!   [`tokio::sync::mpsc::Sender<StreamItem>`](sse::StreamItem) channel
//! - [`ratelimit`] - Quota tracking from response headers plus a local
//!   sliding-window throttle and backoff computation
//! - [`cache`] - Prompt-cache request shaping per model capability
//! - [`error`] - Status-code classification into [`GatewayError`]
//!
//! # Error Handling
//!
//! Non-success responses are classified before being surfaced so callers
//! can distinguish rate-limit and credential failures from generic ones.
//! Mid-stream failures arrive as [`sse::StreamItem::Failed`] on the relay
//! channel rather than `Result::Err`, allowing partial output to be kept.

pub mod cache;
pub mod error;
pub mod ratelimit;
pub mod sse;

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use murmur_types::{ApiKey, CompletionRequest, GenerationId};
use serde::Deserialize;

pub use error::GatewayError;
pub use ratelimit::{BackoffConfig, GovernorConfig, RateLimitGovernor, RateLimitState};

pub use murmur_types;

/// Canonical completion gateway base URL.
pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";

const CONNECT_TIMEOUT_SECS: u64 = 30;

const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!(
                "Failed to build hardened HTTP client: {e}. Attempting minimal hardened fallback."
            );
            reqwest::Client::builder()
                .https_only(true)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Minimal hardened HTTP client must build; cannot proceed without TLS")
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(true)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
}

/// Cost and token accounting for a finished generation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationMetadata {
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub tokens_prompt: Option<u64>,
    #[serde(default)]
    pub tokens_completion: Option<u64>,
    /// Wall-clock generation time in milliseconds.
    #[serde(default)]
    pub generation_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GenerationEnvelope {
    data: GenerationMetadata,
}

/// Authenticated client for the completion gateway.
///
/// Cloning is cheap and clones share the same governor, so rate limit
/// observations from one handle gate requests issued through another.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: ApiKey,
    governor: Arc<Mutex<RateLimitGovernor>>,
}

impl GatewayClient {
    #[must_use]
    pub fn new(api_key: ApiKey) -> Self {
        Self::with_client(http_client().clone(), OPENROUTER_API_URL, api_key)
    }

    /// Construct against an explicit client and base URL. Used by tests to
    /// point at a local mock server.
    #[must_use]
    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: ApiKey,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            governor: Arc::new(Mutex::new(RateLimitGovernor::default())),
        }
    }

    #[must_use]
    pub fn with_governor_config(mut self, config: GovernorConfig) -> Self {
        self.governor = Arc::new(Mutex::new(RateLimitGovernor::new(config)));
        self
    }

    /// Shared governor handle, for callers that gate before requesting.
    #[must_use]
    pub fn governor(&self) -> Arc<Mutex<RateLimitGovernor>> {
        Arc::clone(&self.governor)
    }

    /// Delay the governor requires before the next request, if any.
    #[must_use]
    pub fn required_wait(&self) -> Option<Duration> {
        self.lock_governor().should_wait_before_request(Instant::now())
    }

    /// Backoff delay for retry `attempt` under the governor's policy.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.lock_governor().backoff_delay(attempt)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.lock_governor().max_attempts()
    }

    fn lock_governor(&self) -> std::sync::MutexGuard<'_, RateLimitGovernor> {
        self.governor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a streaming chat completion. The returned response body is an
    /// event-stream; feed it to [`sse::relay_stream`].
    pub async fn chat_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(request);
        self.execute(builder).await
    }

    /// Re-open the stream of an existing generation for resume.
    pub async fn resume_generation(
        &self,
        generation_id: &GenerationId,
    ) -> Result<reqwest::Response, GatewayError> {
        let builder = self
            .http
            .get(format!("{}/generation", self.base_url))
            .query(&[("id", generation_id.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream");
        self.execute(builder).await
    }

    /// Fetch cost/token accounting for a finished generation.
    pub async fn generation_metadata(
        &self,
        generation_id: &GenerationId,
    ) -> Result<GenerationMetadata, GatewayError> {
        let builder = self
            .http
            .get(format!("{}/generation", self.base_url))
            .query(&[("id", generation_id.as_str())]);
        let response = self.execute(builder).await?;
        let envelope: GenerationEnvelope = response.json().await?;
        Ok(envelope.data)
    }

    /// Check the API key by listing models; any 2xx means valid.
    pub async fn validate_key(&self) -> Result<bool, GatewayError> {
        let builder = self.http.get(format!("{}/models", self.base_url));
        match self.execute(builder).await {
            Ok(_) => Ok(true),
            Err(GatewayError::InvalidCredentials(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Send an authenticated request, record it in the governor, fold the
    /// response's quota headers back in, and classify non-success statuses.
    async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        self.lock_governor().record_request(Instant::now());

        let response = builder
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await?;

        let state = RateLimitState::from_headers(response.headers());
        self.lock_governor().observe_response(response.headers());

        if response.status().is_success() {
            return Ok(response);
        }
        Err(error::classify_error_response(response, state).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_types::Message;
    use sse::StreamItem;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> GatewayClient {
        GatewayClient::with_client(
            reqwest::Client::new(),
            server.uri(),
            ApiKey::new("sk-or-test"),
        )
    }

    fn chat_request() -> CompletionRequest {
        CompletionRequest::new("anthropic/claude-sonnet-4", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn streams_chat_completion() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"id\":\"gen-abc\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-or-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let response = client.chat_completion(&chat_request()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        sse::relay_stream(response, tx).await;

        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        assert_eq!(items.len(), 3);
        let StreamItem::Chunk(first) = &items[0] else {
            panic!("expected chunk, got {:?}", items[0]);
        };
        assert_eq!(first.id.as_deref(), Some("gen-abc"));
        assert!(matches!(items[2], StreamItem::End));
    }

    #[tokio::test]
    async fn classifies_rate_limit_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "30")
                    .insert_header("x-ratelimit-remaining-requests", "0")
                    .set_body_string(r#"{"error":{"message":"slow down"}}"#),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.chat_completion(&chat_request()).await.unwrap_err();
        let GatewayError::RateLimited { retry_after, state } = err else {
            panic!("expected RateLimited, got {err:?}");
        };
        assert_eq!(retry_after, Some(Duration::from_secs(30)));
        assert!(state.is_rate_limited());

        // Quota state is now visible through the shared governor.
        assert!(client.required_wait().is_some());
    }

    #[tokio::test]
    async fn classifies_credential_and_credit_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error":{"message":"bad key"}}"#),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(402)
                    .set_body_string(r#"{"error":{"message":"out of credits"}}"#),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.chat_completion(&chat_request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredentials(ref m) if m == "bad key"));

        let err = client.chat_completion(&chat_request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientCredits(ref m) if m == "out of credits"));
    }

    #[tokio::test]
    async fn validates_api_key_via_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":[]}"#))
            .mount(&server)
            .await;

        let client = test_client(&server);
        assert!(client.validate_key().await.unwrap());
    }

    #[tokio::test]
    async fn invalid_key_reports_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        assert!(!client.validate_key().await.unwrap());
    }

    #[tokio::test]
    async fn fetches_generation_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generation"))
            .and(query_param("id", "gen-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":{"id":"gen-abc","model":"anthropic/claude-sonnet-4","total_cost":0.0042,"tokens_prompt":120,"tokens_completion":64,"generation_time":1830}}"#,
            ))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let meta = client
            .generation_metadata(&GenerationId::new("gen-abc"))
            .await
            .unwrap();
        assert_eq!(meta.id, "gen-abc");
        assert_eq!(meta.total_cost, Some(0.0042));
        assert_eq!(meta.tokens_prompt, Some(120));
    }

    #[tokio::test]
    async fn quota_headers_update_governor_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-ratelimit-limit-requests", "100")
                    .insert_header("x-ratelimit-remaining-requests", "42")
                    .set_body_string(r#"{"data":[]}"#),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        client.validate_key().await.unwrap();

        let governor = client.governor();
        let governor = governor.lock().unwrap();
        let state = governor.state().expect("state observed");
        assert_eq!(state.requests.remaining, Some(42));
        assert!(!state.is_rate_limited());
    }
}
