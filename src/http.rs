//! Resilient outbound HTTP.
//!
//! Every provider call goes through [`HttpClient::fetch_with_retry`], which
//! wraps a single `reqwest` exchange in a per-attempt timeout and a retry
//! loop.
//!
//! # Retry Strategy
//!
//! - HTTP 2xx → done, the first success wins
//! - HTTP 429 → wait `Retry-After` seconds if the header is present,
//!   otherwise back off; counts against the attempt budget
//! - HTTP 5xx → back off and retry
//! - Network error or attempt timeout → back off and retry
//! - Any other status → fail immediately, no retry
//! - Backoff: `min(base · 2^(attempt-1), cap)`
//!
//! Nothing sleeps after the final attempt.

use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::FetchError;

const USER_AGENT: &str = concat!("hazard-ingest/", env!("CARGO_PKG_VERSION"));

/// Longest response-body excerpt kept in a [`FetchError::Client`].
const BODY_EXCERPT_LEN: usize = 512;

/// Backoff and timeout constants for outbound requests. The attempt budget
/// is chosen per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wall-clock limit for one attempt, including reading the body.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Exponential delay after the given 1-based attempt, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt. A server-provided `Retry-After` wins
    /// over the exponential schedule.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.backoff(attempt))
    }
}

/// An outbound request that can be replayed for every attempt.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
    pub content_type: Option<&'static str>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: None,
            content_type: None,
        }
    }

    pub fn post_text(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            body: Some(body.into()),
            content_type: Some("text/plain"),
        }
    }
}

/// A fully read 2xx response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl HttpResponse {
    /// Decode the body into a provider schema.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_str(&self.body).map_err(|e| FetchError::Decode {
            url: redact(&self.url),
            message: e.to_string(),
        })
    }
}

/// What one attempt produced before classification.
struct RawAttempt {
    status: u16,
    retry_after: Option<Duration>,
    body: String,
}

/// Shared HTTP client with a retry policy. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client, policy })
    }

    /// Send `request` until it succeeds or `max_attempts` is used up.
    ///
    /// Each stage passes its own budget, so cheap failure-tolerant lookups
    /// can ask for fewer tries than page fetches.
    pub async fn fetch_with_retry(
        &self,
        request: &HttpRequest,
        max_attempts: u32,
    ) -> Result<HttpResponse, FetchError> {
        let max_attempts = max_attempts.max(1);
        let target = redact(&request.url);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            let outcome = tokio::time::timeout(self.policy.timeout, self.send_once(request)).await;

            let (err, delay) = match outcome {
                Err(_) => (
                    FetchError::Network {
                        attempts: attempt,
                        message: format!("attempt timed out after {:?}", self.policy.timeout),
                    },
                    self.policy.backoff(attempt),
                ),
                Ok(Err(e)) => (
                    FetchError::Network {
                        attempts: attempt,
                        message: e.to_string(),
                    },
                    self.policy.backoff(attempt),
                ),
                Ok(Ok(raw)) => match raw.status {
                    200..=299 => {
                        if attempt > 1 {
                            tracing::debug!(url = %target, attempt, "request succeeded after retry");
                        }
                        return Ok(HttpResponse {
                            status: raw.status,
                            url: request.url.clone(),
                            body: raw.body,
                        });
                    }
                    429 => (
                        FetchError::RateLimited {
                            attempts: attempt,
                            retry_after: raw.retry_after,
                        },
                        self.policy.delay_for(attempt, raw.retry_after),
                    ),
                    500..=599 => (
                        FetchError::Server {
                            status: raw.status,
                            attempts: attempt,
                        },
                        self.policy.backoff(attempt),
                    ),
                    status => {
                        return Err(FetchError::Client {
                            status,
                            body: excerpt(&raw.body),
                        })
                    }
                },
            };

            if attempt < max_attempts {
                tracing::warn!(
                    url = %target,
                    attempt,
                    max_attempts,
                    status = err.status(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| FetchError::Network {
            attempts: 0,
            message: "no attempt was made".to_string(),
        }))
    }

    /// [`fetch_with_retry`](Self::fetch_with_retry) followed by a typed decode.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: &HttpRequest,
        max_attempts: u32,
    ) -> Result<T, FetchError> {
        self.fetch_with_retry(request, max_attempts).await?.json()
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<RawAttempt, reqwest::Error> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await?;

        Ok(RawAttempt {
            status,
            retry_after,
            body,
        })
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values fall back to backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Strip the query string so access tokens never reach the logs.
pub fn redact(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?…", base),
        None => url.to_string(),
    }
}

fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_LEN {
        return body.to_string();
    }
    let mut end = BODY_EXCERPT_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
