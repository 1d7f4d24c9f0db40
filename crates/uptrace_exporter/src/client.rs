//! HTTP delivery with bounded retry.
//!
//! One [`DeliveryClient`] is shared by every export task. A call to
//! [`DeliveryClient::post`] makes at most `max_retries + 1` attempts; the
//! backoff sleep before each retry races a [`CancellationToken`] so shutdown
//! never waits for a sleeping retry.

use crate::encoding::{CONTENT_ENCODING, CONTENT_TYPE};
use crate::invariants::debug_assert_backoff_capped;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING as CONTENT_ENCODING_HEADER, CONTENT_TYPE as CONTENT_TYPE_HEADER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection, TLS, timeout or body errors.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response. `message` is taken from a JSON `{"message": ...}` body.
    #[error("server returned {code}: {}", .message.as_deref().unwrap_or("no message"))]
    Status { code: u16, message: Option<String> },

    /// Shutdown cancelled the call while it was waiting to retry.
    #[error("delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// 5xx responses and transport failures other than request-construction
    /// errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport(err) => !err.is_builder(),
            DeliveryError::Status { code, .. } => (500..600).contains(code),
            DeliveryError::Cancelled => false,
        }
    }

    /// HTTP status code, if the server answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = only the initial attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before attempt `attempt` (0-indexed): zero for the first attempt,
    /// then `base_delay * 2^(attempt-1)` capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Shared HTTP client that posts encoded payloads.
#[derive(Debug)]
pub struct DeliveryClient {
    http: Client,
    retry: RetryConfig,
    total_retries: AtomicU64,
}

impl DeliveryClient {
    /// Builds a client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be created.
    pub fn new(retry: RetryConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, retry))
    }

    /// Wraps an existing `reqwest::Client`.
    pub fn with_client(http: Client, retry: RetryConfig) -> Self {
        Self {
            http,
            retry,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Retry attempts made over the client's lifetime.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Posts `payload` to `endpoint`, retrying transient failures.
    ///
    /// Returns the last error once retries are exhausted, a terminal status
    /// at once, or [`DeliveryError::Cancelled`] when `cancel` fires during a
    /// backoff sleep.
    pub async fn post(
        &self,
        endpoint: &str,
        token: &str,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let max_attempts = self.retry.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug_assert_backoff_capped!(delay, self.retry.max_delay);
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let err = match self.send(endpoint, token, payload.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::debug!(endpoint, attempt, "delivery recovered after retry");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            attempt += 1;
            if !err.is_retryable() {
                tracing::debug!(endpoint, error = %err, "non-retryable delivery error");
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(err);
            }
            tracing::debug!(
                endpoint,
                attempt,
                max_retries = self.retry.max_retries,
                error = %err,
                "delivery attempt failed, retrying"
            );
        }
    }

    async fn send(&self, endpoint: &str, token: &str, payload: Bytes) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(token)
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .header(CONTENT_ENCODING_HEADER, CONTENT_ENCODING)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        // Read the body to completion so the connection can be reused.
        let body = response.bytes().await;

        if status.is_success() {
            if let Err(err) = body {
                tracing::debug!(error = %err, "failed to read response body");
            }
            return Ok(());
        }

        Err(DeliveryError::Status {
            code: status.as_u16(),
            message: body.ok().and_then(|body| error_message(status, &body)),
        })
    }
}

fn error_message(status: StatusCode, body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return status.canonical_reason().map(str::to_string);
    }
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { message }) => message,
        Err(_) => Some(String::from_utf8_lossy(body).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_base_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20))
    }

    fn client(retry: RetryConfig) -> DeliveryClient {
        DeliveryClient::new(retry, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_delay_for_attempt() {
        let retry = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(64), Duration::from_millis(1000));

        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = retry.delay_for_attempt(attempt);
            assert!(delay >= previous);
            assert!(delay <= retry.max_delay);
            previous = delay;
        }
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_until_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tracing/1/spans"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = client(fast_retry(2));
        let url = format!("{}/api/v1/tracing/1/spans", server.uri());
        let err = client
            .post(&url, "token", Bytes::from_static(b"x"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(500));
        assert_eq!(client.total_retries(), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"message": "project not found"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client(fast_retry(3));
        let err = client
            .post(&server.uri(), "token", Bytes::from_static(b"x"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DeliveryError::Status { code, message } => {
                assert_eq!(code, 404);
                assert_eq!(message.as_deref(), Some("project not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .and(header("content-type", "application/msgpack"))
            .and(header("content-encoding", "s2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(fast_retry(0))
            .post(&server.uri(), "secret", Bytes::from_static(b"x"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let retry = RetryConfig::default()
            .with_max_retries(5)
            .with_base_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let err = client(retry)
            .post(&server.uri(), "token", Bytes::from_static(b"x"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_sleep() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let retry = RetryConfig::default()
            .with_max_retries(5)
            .with_base_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            })
        };

        let started = std::time::Instant::now();
        let err = client(retry)
            .post(&server.uri(), "token", Bytes::from_static(b"x"), &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, DeliveryError::Cancelled));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop a listener to get a port nobody is serving.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(fast_retry(1))
            .post(
                &format!("http://{addr}/"),
                "token",
                Bytes::from_static(b"x"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Transport(_)));
        assert!(err.is_retryable());
    }
}
