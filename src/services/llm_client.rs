use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use reqwest::{Client, StatusCode};

use crate::config::AppConfig;
use crate::models::llm::LlmRequest;
use crate::services::response_parser::decode_sse_line;

/// Receives decoded text deltas while a streamed response is still arriving.
pub type StreamHandler<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Retry and timeout policy for one outbound LLM call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Ceiling on the total time spent on one call, retries and backoff included.
    pub max_retry_time: Duration,
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_time: Duration::from_secs(90),
            request_timeout: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.llm_max_retries,
            max_retry_time: Duration::from_secs(config.llm_max_retry_time_secs),
            request_timeout: Duration::from_secs(config.llm_request_timeout_secs),
            initial_backoff: Duration::from_millis(config.llm_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.llm_max_backoff_ms),
        }
    }

    /// Capped exponential delays, one per allowed retry.
    fn backoff(&self, max_retries: u32) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(max_retries as usize)
            .build()
    }
}

/// Time left for one call, measured from a start captured once.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    started: Instant,
    limit: Duration,
}

impl RetryBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    /// The delay to sleep before the next attempt, if it still leaves time for that attempt.
    pub fn admit(&self, delay: Duration) -> Option<Duration> {
        admit_delay(delay, self.remaining())
    }
}

/// A retry sleep is allowed only when it ends strictly before the budget does.
pub fn admit_delay(delay: Duration, remaining: Duration) -> Option<Duration> {
    (delay < remaining).then_some(delay)
}

/// Unparsed body returned by a successful call.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub streamed: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("No LLM API key is configured")]
    NoApiKey,

    #[error("LLM API error: {message}")]
    Api { status: Option<u16>, message: String },

    #[error("LLM request timed out: {0}")]
    Timeout(String),
}

impl LlmError {
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::NoApiKey => "no_api_key",
            LlmError::Api { .. } => "api_error",
            LlmError::Timeout(_) => "llm_timeout",
        }
    }
}

enum AttemptError {
    Retryable(LlmError),
    Fatal(LlmError),
}

/// HTTP client for the LLM responses endpoint with budgeted retries.
pub struct LlmClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        policy: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("bizcase-report/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            policy,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.llm_endpoint.clone(),
            config.llm_api_key.clone(),
            RetryPolicy::from_config(config),
        )
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `request`, retrying transient failures while the time budget allows.
    ///
    /// With `on_chunk` the request is sent with `stream: true` and every text
    /// delta is forwarded as it arrives; the full raw body is still returned.
    /// A stream that breaks mid-body is retried from the start, so the handler
    /// sees the deltas of the failed attempt followed by those of the retry.
    /// Only the returned body is authoritative. The body is not interpreted here.
    pub async fn call(
        &self,
        request: &LlmRequest,
        max_retries: Option<u32>,
        on_chunk: Option<&StreamHandler<'_>>,
    ) -> Result<RawResponse, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::NoApiKey)?;
        let max_retries = max_retries.unwrap_or(self.policy.max_retries);

        let mut body = request.clone();
        body.stream = on_chunk.is_some();

        let budget = RetryBudget::start(self.policy.max_retry_time);
        let mut delays = self.policy.backoff(max_retries);
        let mut last_error = None;
        let mut attempt = 0u32;

        loop {
            let remaining = budget.remaining();
            if remaining.is_zero() {
                break;
            }
            attempt += 1;
            metrics::counter!("llm_call_attempts").increment(1);

            let timeout = remaining.min(self.policy.request_timeout);
            match self.send_once(api_key, &body, timeout, on_chunk).await {
                Ok(mut raw) => {
                    raw.attempts = attempt;
                    raw.elapsed = budget.elapsed();
                    tracing::debug!(
                        model = %request.model,
                        attempt,
                        elapsed_ms = raw.elapsed.as_millis() as u64,
                        "LLM call succeeded"
                    );
                    return Ok(raw);
                }
                Err(AttemptError::Fatal(e)) => {
                    tracing::error!(model = %request.model, attempt, error = %e, "LLM call failed, not retrying");
                    return Err(e);
                }
                Err(AttemptError::Retryable(e)) => {
                    tracing::warn!(model = %request.model, attempt, error = %e, "LLM call failed");
                    last_error = Some(e);
                }
            }

            let Some(delay) = delays.next() else {
                break;
            };
            match budget.admit(delay) {
                Some(delay) => {
                    metrics::counter!("llm_call_retries").increment(1);
                    tracing::info!(
                        model = %request.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        remaining_ms = budget.remaining().as_millis() as u64,
                        "Retrying LLM call"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::warn!(
                        model = %request.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Backoff exceeds remaining retry budget, giving up"
                    );
                    break;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LlmError::Timeout(format!(
                "retry budget of {}s exhausted",
                self.policy.max_retry_time.as_secs_f32()
            ))
        }))
    }

    async fn send_once(
        &self,
        api_key: &str,
        body: &LlmRequest,
        timeout: Duration,
        on_chunk: Option<&StreamHandler<'_>>,
    ) -> Result<RawResponse, AttemptError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = LlmError::Api {
                status: Some(status.as_u16()),
                message: error_message(status, &text),
            };
            return Err(if is_retryable_status(status) {
                AttemptError::Retryable(err)
            } else {
                AttemptError::Fatal(err)
            });
        }

        let Some(handler) = on_chunk else {
            let bytes = response.bytes().await.map_err(classify_transport_error)?;
            return Ok(RawResponse {
                status: status.as_u16(),
                body: bytes.to_vec(),
                streamed: false,
                attempts: 0,
                elapsed: Duration::ZERO,
            });
        };

        let mut stream = response.bytes_stream();
        let mut body = Vec::new();
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify_transport_error)?;
            body.extend_from_slice(&chunk);
            pending.extend_from_slice(&chunk);

            // Only complete lines are decoded; a partial line waits for the next chunk.
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                forward_delta(&String::from_utf8_lossy(&line), handler);
            }
        }
        if !pending.is_empty() {
            forward_delta(&String::from_utf8_lossy(&pending), handler);
        }

        Ok(RawResponse {
            status: status.as_u16(),
            body,
            streamed: true,
            attempts: 0,
            elapsed: Duration::ZERO,
        })
    }
}

fn forward_delta(line: &str, handler: &StreamHandler<'_>) {
    if let Ok(Some(chunk)) = decode_sse_line(line) {
        if let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) {
            handler(&delta);
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn classify_transport_error(e: reqwest::Error) -> AttemptError {
    if e.is_timeout() {
        AttemptError::Retryable(LlmError::Timeout(e.to_string()))
    } else if e.is_builder() {
        AttemptError::Fatal(LlmError::Api {
            status: None,
            message: e.to_string(),
        })
    } else {
        AttemptError::Retryable(LlmError::Api {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })
    }
}

/// Human-readable message from an error body, falling back to the status text.
fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

    match from_json {
        Some(message) => format!("HTTP {}: {}", status.as_u16(), message),
        None if body.trim().is_empty() => format!("HTTP {}", status),
        None => {
            let snippet: String = body.trim().chars().take(200).collect();
            format!("HTTP {}: {}", status.as_u16(), snippet)
        }
    }
}
