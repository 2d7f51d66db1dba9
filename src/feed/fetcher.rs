use futures::StreamExt;
use reqwest::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use super::policy::validators_from_headers;
use crate::storage::Validators;

const MAX_RETRIES: u32 = 3;

/// Errors that can occur while retrieving a feed document.
///
/// Every variant is transient from the engine's point of view: the feed is
/// retried on the next cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a non-2xx, non-304 status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// An attempt exceeded the configured fetch timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the configured size limit
    #[error("Response too large (limit {0} bytes)")]
    ResponseTooLarge(usize),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Outcome of a successful HTTP exchange
#[derive(Debug)]
pub enum FetchResponse {
    /// 304: the stored copy is current
    NotModified,
    /// 2xx with the full body and the validators to send next time
    Fetched { body: Vec<u8>, validators: Validators },
}

/// HTTP client for feed documents.
///
/// Sends conditional requests when validators are known, retries 429/5xx
/// and truncated bodies with exponential backoff, and bounds every attempt
/// by a timeout.
#[derive(Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_size: usize,
    retry_base: Duration,
}

impl FeedFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration, max_size: usize) -> Self {
        Self {
            client,
            timeout,
            max_size,
            retry_base: Duration::from_secs(1),
        }
    }

    /// Build a client with the given User-Agent and a bounded redirect chain
    pub fn build_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(client)
    }

    /// First retry delay; doubles on each further retry
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Fetch `url`, conditionally when `validators` carries an ETag or
    /// Last-Modified value.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`] - Connection or TLS errors
    /// - [`FetchError::Timeout`] - An attempt exceeded the timeout
    /// - [`FetchError::HttpStatus`] - 4xx, or 5xx after retries
    /// - [`FetchError::RateLimited`] - 429 after retries
    /// - [`FetchError::ResponseTooLarge`] - Body over the size limit
    /// - [`FetchError::IncompleteResponse`] - Truncated body after retries
    pub async fn fetch(
        &self,
        url: &str,
        validators: Option<&Validators>,
    ) -> Result<FetchResponse, FetchError> {
        let mut retry_count = 0;

        loop {
            let attempt = tokio::time::timeout(self.timeout, self.attempt(url, validators))
                .await
                .map_err(|_| FetchError::Timeout(self.timeout))?;

            let delay = self.retry_base * 2u32.pow(retry_count);
            match attempt {
                Err(FetchError::RateLimited(_)) => {
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::RateLimited(MAX_RETRIES));
                    }
                    tracing::warn!(
                        feed = %url,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                }
                Err(FetchError::HttpStatus(status)) if status >= 500 => {
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::HttpStatus(status));
                    }
                    tracing::warn!(
                        feed = %url,
                        status = status,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Server error, retrying after delay"
                    );
                }
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }
                    tracing::debug!(
                        feed = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                }
                other => return other,
            }

            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    async fn attempt(
        &self,
        url: &str,
        validators: Option<&Validators>,
    ) -> Result<FetchResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(v) = validators {
            if let Some(etag) = &v.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = &v.last_modified {
                request = request.header(IF_MODIFIED_SINCE, modified);
            }
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse::NotModified);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited(0));
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let validators = validators_from_headers(response.headers());
        let body = read_limited_bytes(response, self.max_size).await?;
        Ok(FetchResponse::Fetched { body, validators })
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
