//! HTTP transport abstraction and the retrying fetcher
//!
//! Provides:
//! - `HttpTransport`: single-attempt GET, implemented with reqwest
//! - `MockTransport`: closure-driven transport that records requests
//! - `RetryingFetcher`: bounded retries with backoff on 429 and transport errors

use crate::errors::{AppError, FetchError};
use crate::metrics;
use crate::pacing::{BackoffPolicy, Sleeper};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A GET request: base URL, headers, and query parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Value of the first query parameter named `name`
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Value of the first header named `name` (case-insensitive)
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Base URL with the encoded query string appended
    pub fn full_url(&self) -> String {
        reqwest::Url::parse_with_params(&self.url, &self.query)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| self.url.clone())
    }
}

/// Status and body of a completed HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 200 response with a JSON body
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure before any HTTP status was received
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        FetchError::Transient {
            message: err.to_string(),
        }
    }
}

/// Issues a single GET without any retry
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport with a fixed per-call timeout
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self, AppError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(agent) = user_agent {
            builder = builder.user_agent(agent.to_string());
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse { status, body })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

type MockHandler =
    dyn Fn(&HttpRequest, usize) -> Result<TransportResponse, TransportError> + Send + Sync;

/// Mock transport for testing
///
/// The handler receives each request together with the 0-based index of the
/// call; every request is recorded.
pub struct MockTransport {
    handler: Box<MockHandler>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest, usize) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replays `outcomes` in order, repeating the last one once exhausted
    pub fn sequence(outcomes: Vec<Result<TransportResponse, TransportError>>) -> Self {
        Self::new(move |_, call| {
            outcomes
                .get(call)
                .or_else(|| outcomes.last())
                .cloned()
                .unwrap_or_else(|| Err(TransportError::Network("no scripted response".into())))
        })
    }

    /// All requests received so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError> {
        let call = match self.requests.lock() {
            Ok(mut requests) => {
                requests.push(request.clone());
                requests.len() - 1
            }
            Err(_) => 0,
        };
        (self.handler)(request, call)
    }
}

/// GET with bounded retries, exponential backoff, and jitter on 429
#[derive(Clone)]
pub struct RetryingFetcher {
    transport: Arc<dyn HttpTransport>,
    backoff: Arc<dyn BackoffPolicy>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryingFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        backoff: Arc<dyn BackoffPolicy>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            transport,
            backoff,
            sleeper,
        }
    }

    /// Fetch `request`, returning the body of the first 200 response.
    ///
    /// - 429: waits `rate_limited_delay(attempt)` and retries
    /// - timeout / transport error: waits `transient_delay(attempt)` and
    ///   retries, except after the final attempt
    /// - any other status: fails immediately with `HardHttp`
    pub async fn fetch(&self, request: &HttpRequest, max_attempts: u32) -> Result<String, FetchError> {
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..max_attempts {
            let url = request.full_url();
            info!(url = %url, attempt, max_attempts, "Requesting");

            match self.transport.get(request).await {
                Ok(response) if response.status == 200 => {
                    metrics::record_fetch_outcome("success");
                    return Ok(response.body);
                }
                Ok(response) if response.status == 429 => {
                    let wait = self.backoff.rate_limited_delay(attempt);
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    metrics::record_fetch_retry("rate_limited");
                    last_error = Some(FetchError::RateLimited);
                    self.sleeper.sleep(wait).await;
                }
                Ok(response) => {
                    warn!(url = %url, attempt, status = response.status, "Provider returned error status");
                    metrics::record_fetch_outcome("hard_error");
                    return Err(FetchError::HardHttp {
                        status: response.status,
                    });
                }
                Err(err) => {
                    let is_final = attempt + 1 >= max_attempts;
                    let wait = if is_final {
                        Duration::ZERO
                    } else {
                        self.backoff.transient_delay(attempt)
                    };
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Request failed"
                    );
                    last_error = Some(err.into());
                    if !is_final {
                        metrics::record_fetch_retry("transient");
                        self.sleeper.sleep(wait).await;
                    }
                }
            }
        }

        metrics::record_fetch_outcome("exhausted");
        Err(FetchError::ExhaustedRetries {
            attempts: max_attempts,
            last_error: last_error.map(|e| e.to_string()),
        })
    }

    /// `fetch` followed by JSON decoding of the body
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: &HttpRequest,
        max_attempts: u32,
    ) -> Result<T, FetchError> {
        let body = self.fetch(request, max_attempts).await?;
        serde_json::from_str(&body).map_err(|e| {
            debug!(error = %e, "Response body did not match the expected shape");
            FetchError::Decode {
                message: e.to_string(),
            }
        })
    }
}
