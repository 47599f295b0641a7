//! Shared HTTP plumbing for the REST-backed clients.
//!
//! ## Retry Strategy
//!
//! Object storage, the warehouse and the extraction service all return
//! transient 429 / 5xx errors under load. Every request goes through
//! [`send_with_retry`], which backs off exponentially
//! (`backoff_ms * 2^attempt`): with 500 ms base and 3 retries the wait
//! sequence is 500 ms → 1 s → 2 s. Client errors (4xx other than 408/429)
//! are returned immediately. Clients built on a vendor SDK use
//! [`retry_async`] with their own notion of a transient error.

use crate::error::PipelineError;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry parameters for transient HTTP failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// A request that failed after retries, or failed permanently.
#[derive(Debug, Clone)]
pub struct HttpFailure {
    /// HTTP status when the server answered, `None` for transport errors.
    pub status: Option<u16>,
    pub message: String,
}

impl HttpFailure {
    pub fn is_status(&self, code: u16) -> bool {
        self.status == Some(code)
    }
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(code) => write!(f, "HTTP {code}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Build the `reqwest` client used by one REST collaborator.
pub fn build_client(timeout_secs: u64) -> Result<Client, PipelineError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::Internal(format!("Failed to build HTTP client: {e}")))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Send the request produced by `build`, retrying transient failures.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed
/// by `send()`.
pub async fn send_with_retry<F>(
    what: &str,
    policy: &RetryPolicy,
    build: F,
) -> Result<Response, HttpFailure>
where
    F: Fn() -> RequestBuilder,
{
    let mut last: Option<HttpFailure> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let backoff = policy.delay_for(attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                what,
                attempt,
                policy.max_retries,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        match build().send().await {
            Ok(response) if response.status().is_success() => {
                debug!("{}: HTTP {}", what, response.status());
                return Ok(response);
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let failure = HttpFailure {
                    status: Some(status.as_u16()),
                    message: truncate(&body, 500),
                };
                if !is_retryable_status(status) {
                    return Err(failure);
                }
                warn!("{}: attempt {} failed: {}", what, attempt + 1, failure);
                last = Some(failure);
            }
            Err(e) => {
                let failure = HttpFailure {
                    status: e.status().map(|s| s.as_u16()),
                    message: e.to_string(),
                };
                if !(e.is_timeout() || e.is_connect()) {
                    return Err(failure);
                }
                warn!("{}: attempt {} failed: {}", what, attempt + 1, failure);
                last = Some(failure);
            }
        }
    }

    Err(last.unwrap_or_else(|| HttpFailure {
        status: None,
        message: "Unknown error".to_string(),
    }))
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// the policy's retries are used up.
pub async fn retry_async<T, E, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    retryable: fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && retryable(&e) => {
                attempt += 1;
                let backoff = policy.delay_for(attempt);
                warn!(
                    "{}: attempt {} failed: {}; retry {}/{} after {}ms",
                    what,
                    attempt,
                    e,
                    attempt,
                    policy.max_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}\u{2026}")
    }
}
