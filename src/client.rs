//! HTTP client collaborator.
//!
//! The engine never talks to the network directly. It goes through the
//! [`HttpClient`] trait, which turns one call into a status, a duration and an
//! optional transport error. [`ReqwestClient`] is the production implementation;
//! tests plug in in-memory fakes.

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::errors::{ErrorCategory, RequestError};
use crate::tags::TagSet;

pub use reqwest::Method;

/// Per-call options supplied by the scenario.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Call-site tags, merged with run-level tags by the engine
    pub tags: TagSet,

    /// Overrides the run's request timeout for this call
    pub timeout: Option<Duration>,

    /// Optional request body
    pub body: Option<String>,

    /// Extra request headers
    pub headers: Vec<(String, String)>,

    /// Keep the response body for checks. When false the body is drained and dropped.
    pub capture_body: bool,
}

impl RequestOptions {
    pub fn tagged(tags: TagSet) -> Self {
        Self {
            tags,
            ..Self::default()
        }
    }
}

/// What the engine needs to know about one completed (or failed) request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// None when no response was received
    pub status: Option<u16>,

    /// Wall time from send until the body was consumed or the error surfaced
    pub duration: Duration,

    pub error: Option<RequestError>,

    /// Response body, empty unless `capture_body` was requested
    pub body: String,
}

impl HttpResponse {
    pub fn ok(status: u16, duration: Duration) -> Self {
        Self {
            status: Some(status),
            duration,
            error: None,
            body: String::new(),
        }
    }

    pub fn transport_error(error: RequestError, duration: Duration) -> Self {
        Self {
            status: None,
            duration,
            error: Some(error),
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// A request failed when it errored at the transport level or came back
    /// with a status outside 200-399.
    pub fn failed(&self) -> bool {
        self.error_category().is_some()
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        if let Some(err) = &self.error {
            return Some(err.category);
        }
        match self.status {
            Some(code) => ErrorCategory::from_status_code(code),
            None => Some(ErrorCategory::OtherError),
        }
    }
}

/// Anything capable of issuing a tagged HTTP request with a timeout.
///
/// Implementations must never panic or return early on transport failure;
/// failures are reported through [`HttpResponse::error`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, method: Method, url: &str, options: &RequestOptions) -> HttpResponse;
}

/// Configuration for building the reqwest-backed client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-request timeout
    pub timeout: Duration,

    /// Maximum idle connections to keep per host
    pub max_idle_per_host: usize,

    /// How long idle connections stay in the pool
    pub idle_timeout: Duration,

    /// TCP keepalive duration
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Apply pool settings to a reqwest ClientBuilder.
    fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        let mut builder = builder
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout);

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder
    }
}

/// Production [`HttpClient`] on top of a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    default_timeout: Duration,
}

/// Builds the reqwest client used by every worker.
///
/// One client is shared by all workers so connections are pooled.
pub fn build_client(config: &ClientConfig) -> Result<ReqwestClient, reqwest::Error> {
    let client = config.apply_to_builder(reqwest::Client::builder()).build()?;
    debug!(
        max_idle_per_host = config.max_idle_per_host,
        idle_timeout = ?config.idle_timeout,
        timeout = ?config.timeout,
        "HTTP client configured"
    );
    Ok(ReqwestClient {
        client,
        default_timeout: config.timeout,
    })
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(&self, method: Method, url: &str, options: &RequestOptions) -> HttpResponse {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let mut req = self.client.request(method, url).timeout(timeout);
        for (name, value) in &options.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &options.body {
            req = req.body(body.clone());
        }

        let start = Instant::now();
        let mut response = match req.send().await {
            Ok(r) => r,
            Err(e) => return HttpResponse::transport_error(RequestError::from_reqwest(&e), start.elapsed()),
        };
        let status = response.status().as_u16();

        // The timing includes reading the body so slow transfers are visible.
        let mut body = String::new();
        if options.capture_body {
            match response.text().await {
                Ok(text) => body = text,
                Err(e) => {
                    let mut failed =
                        HttpResponse::transport_error(RequestError::from_reqwest(&e), start.elapsed());
                    failed.status = Some(status);
                    return failed;
                }
            }
        } else {
            loop {
                match response.chunk().await {
                    Ok(Some(_chunk)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        let mut failed = HttpResponse::transport_error(
                            RequestError::from_reqwest(&e),
                            start.elapsed(),
                        );
                        failed.status = Some(status);
                        return failed;
                    }
                }
            }
        }

        HttpResponse::ok(status, start.elapsed()).with_body(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_response_with_success_status_is_not_failed() {
        let res = HttpResponse::ok(200, Duration::from_millis(5));
        assert!(!res.failed());
        assert_eq!(res.error_category(), None);
    }

    #[test]
    fn error_status_is_failed() {
        let res = HttpResponse::ok(500, Duration::from_millis(5));
        assert!(res.failed());
        assert_eq!(res.error_category(), Some(ErrorCategory::ServerError));
    }

    #[test]
    fn transport_error_is_failed() {
        let res = HttpResponse::transport_error(
            RequestError::timeout("too slow"),
            Duration::from_secs(60),
        );
        assert!(res.failed());
        assert_eq!(res.status, None);
        assert_eq!(res.error_category(), Some(ErrorCategory::TimeoutError));
    }

    #[test]
    fn pool_defaults() {
        let config = ClientConfig::default().with_timeout(Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_idle_per_host, 32);
    }
}
