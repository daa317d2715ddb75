//! Streaming client for OpenAI-compatible chat completion endpoints.
//!
//! Epistemic foundation:
//! - K_i: The chat completions schema is the de facto standard (NIM, vLLM, OpenRouter, Ollama)
//! - K_i: `stream: true` turns the body into server-sent events
//! - B_i: The endpoint accepts the request (might fail) → retry with backoff
//! - I^B: Once streaming, the connection may drop at any time → surfaced per fragment

use crate::client::{sse_text_stream, CompletionBackend, CompletionRequest, Message, RateLimiter, TextStream};
use crate::models::{expand_headers, ApiError, Config, DistillError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest wait between two attempts.
const MAX_BACKOFF_SECS: u64 = 60;

/// Exponential backoff before the attempt after `attempt`, capped.
fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

/// Streamed chat completion payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    stream: bool,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// HTTP backend for any OpenAI-compatible endpoint.
///
/// Opening a stream is retried; the stream itself is not. A failure after
/// the first byte shows up as an `Err` item on the returned [`TextStream`].
pub struct LlmClient {
    client: reqwest::Client,
    /// Name of this endpoint (for logging)
    name: String,
    /// API key (None for local endpoints without auth)
    api_key: Option<String>,
    /// Base URL for the API, without trailing slash
    base_url: String,
    /// Additional request headers, already env-expanded
    custom_headers: HashMap<String, String>,
    /// Overall request timeout, streaming body included
    timeout: Duration,
    /// Attempts at opening a stream
    max_retries: u32,
    rate_limiter: Arc<RateLimiter>,
}

impl LlmClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// - `name`: Endpoint name for logging
    /// - `api_key`: Optional bearer token
    /// - `base_url`: Base URL, e.g. `http://localhost:8000/v1`
    /// - `custom_headers`: Extra headers sent with every request
    /// - `timeout`: Overall request timeout
    /// - `connect_timeout`: TCP/TLS connect timeout
    /// - `max_retries`: Attempts at opening a stream (at least 1)
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        custom_headers: HashMap<String, String>,
        timeout: Duration,
        connect_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(DistillError::Network)?;

        Ok(Self {
            client,
            name: name.into(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            custom_headers,
            timeout,
            max_retries: max_retries.max(1),
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    /// Build a client from the `[endpoint]` config section.
    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = &config.endpoint;
        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            debug!(env_var = %endpoint.api_key_env, "No API key configured; sending unauthenticated requests");
        }

        Self::new(
            "endpoint",
            api_key,
            endpoint.base_url.clone(),
            expand_headers(&endpoint.headers),
            Duration::from_secs(endpoint.timeout_secs),
            Duration::from_secs(endpoint.connect_timeout_secs),
            endpoint.max_retries,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Build headers for a request. Custom headers that are not valid HTTP
    /// are skipped with a warning.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(ref api_key) = self.api_key {
            match HeaderValue::from_str(&format!("Bearer {api_key}")) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!(endpoint = %self.name, "API key is not a valid header value; omitting it"),
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        for (key, value) in &self.custom_headers {
            match (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(val)) => {
                    headers.insert(name, val);
                }
                _ => warn!(endpoint = %self.name, header = %key, "Skipping invalid custom header"),
            }
        }

        headers
    }

    /// Open a streamed completion.
    ///
    /// B_i(endpoint reachable) → retried up to `max_retries` times
    /// B_i(request accepted) → 401/404 fail at once, 429/5xx are retried
    /// I^B(stream survives) → left to the caller via the returned stream
    pub async fn open_stream(&self, request: &CompletionRequest) -> Result<TextStream> {
        let payload = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            max_tokens: request.params.max_tokens,
            stream: true,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error: Option<DistillError> = None;

        for attempt in 0..self.max_retries {
            self.rate_limiter.wait_if_needed(&request.model).await;
            let started = Instant::now();

            let response = self
                .client
                .post(&url)
                .headers(self.headers())
                .json(&payload)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        DistillError::Timeout(self.timeout)
                    } else {
                        DistillError::Network(e)
                    });
                    if attempt + 1 < self.max_retries {
                        let backoff = retry_backoff(attempt);
                        debug!(
                            endpoint = %self.name,
                            attempt,
                            backoff_secs = backoff.as_secs(),
                            "Retrying after network error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();
            self.rate_limiter
                .record_response(&request.model, status, response.headers());

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .unwrap_or(1.0);
                debug!(
                    endpoint = %self.name,
                    attempt,
                    retry_after_secs = retry_after,
                    "Rate limited, waiting"
                );
                // The limiter holds the backoff; the next attempt waits on it.
                last_error = Some(DistillError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }

            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiErrorResponse>(&body)
                    .map(|r| r.error.message)
                    .unwrap_or(body);
                let error = match status {
                    401 => ApiError::AuthenticationFailed,
                    404 => ApiError::ModelNotFound(request.model.clone()),
                    _ => ApiError::Status { status, message },
                };
                last_error = Some(DistillError::Api(error));

                // Client errors will not change on retry
                if status < 500 {
                    break;
                }

                if attempt + 1 < self.max_retries {
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                continue;
            }

            debug!(
                endpoint = %self.name,
                model = %request.model,
                attempt,
                ttfb_ms = started.elapsed().as_millis() as u64,
                "Stream opened"
            );
            return Ok(sse_text_stream(response.bytes_stream()));
        }

        Err(match last_error {
            Some(e) if e.is_retryable() && self.max_retries > 1 => {
                DistillError::Api(ApiError::MaxRetriesExceeded {
                    attempts: self.max_retries,
                    last_error: e.to_string(),
                })
            }
            Some(e) => e,
            None => DistillError::Api(ApiError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "Unknown error".to_string(),
            }),
        })
    }

    /// Ping `GET {base_url}/models`.
    ///
    /// K_i: endpoint is reachable and responding
    /// B_i: endpoint is healthy if /models returns 2xx
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let url = format!("{}/models", self.base_url);

        match self
            .client
            .get(&url)
            .headers(self.headers())
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let healthy = response.status().is_success();
                HealthCheckResult {
                    endpoint: self.base_url.clone(),
                    status: if healthy {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    },
                    latency_ms: Some(latency_ms),
                    error: (!healthy).then(|| format!("HTTP {}", response.status().as_u16())),
                }
            }
            Err(e) => HealthCheckResult {
                endpoint: self.base_url.clone(),
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

impl CompletionBackend for LlmClient {
    fn submit<'a>(&'a self, request: &'a CompletionRequest) -> BoxFuture<'a, Result<TextStream>> {
        self.open_stream(request).boxed()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Endpoint URL
    pub endpoint: String,
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}
