//! HTTP transport to the remote search service.
//!
//! [`TransportClient`] issues one logical request per call and retries
//! transient failures with exponential backoff through [`RetryPolicy`].
//! It holds no state besides the underlying `reqwest` connection pool,
//! which is internally synchronized, so a single client can be cloned and
//! shared across concurrent pipeline groups.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately with the remote payload
//! - Network errors and per-attempt timeouts → retry
//! - Backoff: `initial`, `2 × initial`, `4 × initial`, ... capped at `max_backoff`

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IndexError, Result};

/// Explicit retry wrapper applied at transport call sites.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(16),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Only errors for which
    /// [`IndexError::is_transient`] holds are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// 204, or a success status with an empty body.
    NoContent,
    /// Parsed body. Non-JSON text bodies are kept as `Value::String`.
    Body { status: u16, value: Value },
}

impl Response {
    /// Decode the body into `T`, reporting failures against `operation`.
    pub fn decode<T: DeserializeOwned>(self, operation: &str) -> Result<T> {
        match self {
            Response::NoContent => Err(IndexError::Decode {
                operation: operation.to_string(),
                message: "expected a body, got no content".to_string(),
            }),
            Response::Body { value, .. } => {
                serde_json::from_value(value).map_err(|e| IndexError::Decode {
                    operation: operation.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Response::NoContent => 204,
            Response::Body { status, .. } => *status,
        }
    }
}

/// Connection settings for [`TransportClient`].
#[derive(Debug)]
pub struct TransportConfig {
    /// Service base URL, e.g. `https://my-search.search.windows.net`.
    pub endpoint: String,
    pub api_version: String,
    pub api_key: Option<SecretString>,
    /// Applied to each attempt separately.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_version: "2024-07-01".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportClient {
    http: reqwest::Client,
    endpoint: String,
    api_version: String,
    api_key: Option<Arc<SecretString>>,
    retry: RetryPolicy,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IndexError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_version: config.api_version,
            api_key: config.api_key.map(Arc::new),
            retry: config.retry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Issue `method path` with an optional JSON body, retrying transient failures.
    ///
    /// `path` is relative to the endpoint and may carry its own query
    /// string; `api-version` is appended.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        let label = format!("{} {}", method.as_str(), path);
        let request_id = uuid::Uuid::new_v4().to_string();

        self.retry
            .run(&label, |attempt| {
                let label = label.clone();
                let request_id = request_id.clone();
                async move {
                    debug!(operation = %label, attempt, request_id = %request_id, "sending request");
                    self.send_once(method, path, body, &label, &request_id).await
                }
            })
            .await
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        label: &str,
        request_id: &str,
    ) -> Result<Response> {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self
            .http
            .request(method.as_reqwest(), &url)
            .query(&[("api-version", self.api_version.as_str())])
            .header("client-request-id", request_id)
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key.expose_secret());
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| IndexError::Transient {
            operation: label.to_string(),
            status: None,
            message: if e.is_timeout() {
                format!("timed out: {}", e)
            } else {
                e.to_string()
            },
        })?;

        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Response::NoContent);
            }
            let text = response.text().await.map_err(|e| IndexError::Transient {
                operation: label.to_string(),
                status: Some(status.as_u16()),
                message: format!("failed to read body: {}", e),
            })?;
            let text = text.trim_start_matches('\u{feff}');
            if text.trim().is_empty() {
                return Ok(Response::NoContent);
            }
            let value = serde_json::from_str(text)
                .unwrap_or_else(|_| Value::String(text.trim().to_string()));
            return Ok(Response::Body {
                status: status.as_u16(),
                value,
            });
        }

        let text = response.text().await.unwrap_or_default();
        Err(IndexError::from_status(label, status.as_u16(), text))
    }
}
