//! HTTP transport for the ingestion API.
//!
//! Each call to [`HttpTransport::send`] is one logical request: it is refused
//! locally when cached rate-limit state says the server would reject it,
//! retried with exponential backoff on transient failures, and every real
//! response feeds its rate-limit headers back into the tracker.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT,
};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{is_retryable_status, ClientError, Result};
use crate::limit::{scope_from_headers, Category, RateLimit, RateLimitTracker};

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Header naming the organization a token acts for.
pub const ORG_ID_HEADER: &str = "x-org-id";

const USER_AGENT_VALUE: &str = concat!("event-shipper/", env!("CARGO_PKG_VERSION"));

/// Retry behaviour for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per request, including the first
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further attempt
    pub base_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(MAX_RETRY_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1 for the first retry).
    ///
    /// delay = min(base_delay * 2^(attempt - 1) + jitter, max_delay)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(16);
        let exponential = base_ms.saturating_mul(1 << exponent);

        let jitter = if self.jitter {
            rand::random::<u64>() % (exponential / 4 + 1)
        } else {
            0
        };

        let max_ms = self.max_delay.as_millis() as u64;
        Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
    }
}

/// One logical API request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,

    /// Path below the base URL, starting with `/`
    pub path: String,

    /// Selects the rate-limit headers that apply
    pub category: Category,

    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub content_type: Option<&'static str>,
    pub content_encoding: Option<&'static str>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>, category: Category) -> Self {
        Self {
            method,
            path: path.into(),
            category,
            query: Vec::new(),
            body: None,
            content_type: None,
            content_encoding: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, Category::Api)
    }

    pub fn query(mut self, pairs: Vec<(String, String)>) -> Self {
        self.query = pairs;
        self
    }

    pub fn body(mut self, body: Bytes, content_type: &'static str) -> Self {
        self.body = Some(body);
        self.content_type = Some(content_type);
        self
    }

    pub fn json_body<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.body(Bytes::from(body), "application/json"))
    }

    pub fn content_encoding(mut self, encoding: &'static str) -> Self {
        self.content_encoding = Some(encoding);
        self
    }
}

/// HTTP transport with retries and rate-limit awareness.
///
/// The client is reused for connection pooling. Rate-limit state lives in
/// this instance, so separate transports never share it.
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Base URL of the API
    base_url: String,

    token: String,
    org_id: Option<String>,
    timeout: Duration,
    retry: RetryConfig,
    limits: RateLimitTracker,
}

impl HttpTransport {
    /// Create a new transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.clone(),
            token: config.token.clone(),
            org_id: config.org_id.clone(),
            timeout: config.request_timeout,
            retry: config.retry_config(),
            limits: RateLimitTracker::new(),
        })
    }

    /// Replace the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Send a request and decode the JSON response body.
    ///
    /// Returns `Ok(None)` for successful responses without a body.
    ///
    /// # Retryable Errors
    ///
    /// The following errors trigger retries:
    /// - Network connection errors
    /// - Request timeouts
    /// - 500, 502, 503 and 504 responses
    ///
    /// # Non-Retryable Errors
    ///
    /// The following errors fail after one attempt:
    /// - 429, reported as `ClientError::RateLimited`
    /// - Other 4xx responses
    /// - Parse errors
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: &TransportRequest,
    ) -> Result<Option<T>> {
        if let Some(limit) = self.limits.exhausted(request.category, Utc::now()) {
            warn!(
                category = %request.category,
                scope = %limit.scope,
                reset_at = ?limit.reset_at,
                path = %request.path,
                "Rate limit exhausted, not sending request"
            );
            return Err(ClientError::RateLimited {
                limit,
                short_circuited: true,
            });
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.retry.backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    path = %request.path,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            debug!(
                method = %request.method,
                path = %request.path,
                attempt = attempt,
                "Sending request"
            );

            let response = match self.dispatch(request).await {
                Ok(response) => response,
                Err(e) => {
                    let err = ClientError::from(e);
                    if err.is_retryable() && attempt < max_attempts {
                        warn!(error = %err, attempt = attempt, "Request failed, will retry");
                        continue;
                    }
                    error!(error = %err, attempts = attempt, "Request failed permanently");
                    return Err(err);
                }
            };

            let status = response.status();
            let record = self.limits.update(request.category, response.headers());

            if status.is_success() {
                return parse_body(response).await;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let limit = record.unwrap_or_else(|| {
                    RateLimit::unknown(
                        request.category,
                        scope_from_headers(request.category, response.headers()),
                    )
                });
                warn!(
                    category = %request.category,
                    reset_at = ?limit.reset_at,
                    path = %request.path,
                    "Server rate limited request"
                );
                return Err(ClientError::RateLimited {
                    limit,
                    short_circuited: false,
                });
            }

            if is_retryable_status(status) && attempt < max_attempts {
                warn!(
                    status = status.as_u16(),
                    attempt = attempt,
                    "Server error, will retry"
                );
                continue;
            }

            let message = error_message(response).await;
            error!(
                status = status.as_u16(),
                attempts = attempt,
                message = %message,
                "Request failed permanently"
            );
            return Err(ClientError::Status {
                code: status,
                message,
            });
        }
    }

    /// Send a single HTTP request without retry logic.
    async fn dispatch(&self, request: &TransportRequest) -> reqwest::Result<Response> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .timeout(self.timeout)
            .headers(self.default_headers());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(encoding) = request.content_encoding {
            builder = builder.header(CONTENT_ENCODING, encoding);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        builder.send().await
    }

    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = format!("Bearer {}", self.token).parse::<HeaderValue>() {
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if let Some(value) = self
            .org_id
            .as_deref()
            .and_then(|id| id.parse::<HeaderValue>().ok())
        {
            headers.insert(ORG_ID_HEADER, value);
        }
        headers
    }

    /// Rate-limit state observed by this transport.
    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.limits
    }

    /// Get the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the retry settings.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

async fn parse_body<T: DeserializeOwned>(response: Response) -> Result<Option<T>> {
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }

    let body = response.bytes().await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| ClientError::Parse(e.to_string()))
}

/// Server-provided error message, falling back to the body text and then
/// the status reason.
async fn error_message(response: Response) -> String {
    let status = response.status();
    let fallback = || {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    };

    let body = match response.text().await {
        Ok(body) => body,
        Err(_) => return fallback(),
    };

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        for field in ["message", "error"] {
            if let Some(message) = value.get(field).and_then(|v| v.as_str()) {
                return message.to_string();
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}
