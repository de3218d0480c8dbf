//! Transport to the ingestion endpoint
//!
//! The delivery engine only depends on the [`Transport`] trait. [`HttpTransport`]
//! is the default implementation: it POSTs a JSON array of events and turns the
//! HTTP status into an [`AckInfo`] or a classified [`TransportError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};

use crate::error::{Error, Result};

/// Server acknowledgement of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckInfo {
    /// HTTP status (or equivalent) returned by the endpoint
    pub status: u16,
}

/// Failure to deliver a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the endpoint (DNS, connect, TLS, reset)
    #[error("network error: {0}")]
    Network(String),

    /// No response within the transport's timeout
    #[error("request timed out")]
    Timeout,

    /// The endpoint answered with a non-success status
    #[error("server returned {status}: {message}")]
    Rejected {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    /// Permanent rejections are dropped instead of retried.
    ///
    /// 408 and 429 are retryable, as is every 5xx; any other 4xx means the
    /// server will never accept this payload.
    pub fn is_permanent(&self) -> bool {
        match self {
            TransportError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Rejected { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Sends one serialized batch to the ingestion endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(
        &self,
        endpoint: &str,
        batch: &[u8],
    ) -> std::result::Result<AckInfo, TransportError>;
}

/// Told when a submission starts and stops, e.g. to drive a spinner.
pub trait ActivityIndicator: Send + Sync {
    fn set_active(&self, active: bool);
}

/// Endpoint URL for a project token.
pub fn track_endpoint(server_url: &str, token: &str) -> String {
    let base = server_url.trim().trim_end_matches('/');
    let base = if base.contains("://") {
        base.to_string()
    } else {
        format!("https://{}", base)
    };
    format!("{}/track/{}", base, urlencoding::encode(token))
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("tally/", env!("CARGO_PKG_VERSION"))),
        );

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(
        &self,
        endpoint: &str,
        batch: &[u8],
    ) -> std::result::Result<AckInfo, TransportError> {
        let response = self
            .http_client
            .post(endpoint)
            .body(batch.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(AckInfo {
                status: status.as_u16(),
            });
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
            retry_after,
        })
    }
}

/// Parse a `Retry-After` header given in seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
