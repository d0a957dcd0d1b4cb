//! The unit of work a worker runs once per iteration.
//!
//! A [`Scenario`] receives an [`IterationContext`] through which it issues
//! tagged requests and records named checks. The context is what guarantees
//! that every request yields exactly one `http_req_duration` sample and one
//! `http_req_failed` sample, tagged with the call-site tags merged over the
//! run-level tags.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use crate::checks::{run_checks, Check};
use crate::client::{HttpClient, HttpResponse, Method, RequestOptions};
use crate::clock::RunClock;
use crate::collector::{CheckResult, CollectorHandle};
use crate::errors::ScenarioError;
use crate::metrics::{
    status_code_label, REQUEST_DURATION_SECONDS, REQUEST_ERRORS_BY_CATEGORY,
    REQUEST_STATUS_CODES, REQUEST_TOTAL,
};
use crate::tags::TagSet;

/// A pluggable scenario, invoked once per iteration per worker.
#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    /// Perform one iteration. Transport failures are not errors here; they
    /// are recorded as failed samples by [`IterationContext::request`].
    async fn iterate(&self, ctx: &mut IterationContext<'_>) -> Result<(), ScenarioError>;
}

/// A completed request together with the tags its samples were recorded under.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub response: HttpResponse,
    pub tags: Arc<TagSet>,
}

/// Engine services available to a scenario during one iteration.
pub struct IterationContext<'a> {
    pub worker_id: usize,
    pub iteration: u64,
    client: &'a dyn HttpClient,
    collector: &'a CollectorHandle,
    run_tags: &'a TagSet,
    clock: RunClock,
    requests: usize,
}

impl<'a> IterationContext<'a> {
    pub fn new(
        worker_id: usize,
        iteration: u64,
        client: &'a dyn HttpClient,
        collector: &'a CollectorHandle,
        run_tags: &'a TagSet,
        clock: RunClock,
    ) -> Self {
        Self {
            worker_id,
            iteration,
            client,
            collector,
            run_tags,
            clock,
            requests: 0,
        }
    }

    /// Issue one request and record its duration and failed samples.
    pub async fn request(&mut self, method: Method, url: &str, options: RequestOptions) -> Recorded {
        let tags = Arc::new(self.run_tags.merged(&options.tags));

        REQUEST_TOTAL.inc();
        let response = self.client.request(method, url, &options).await;
        let timestamp = self.clock.elapsed();
        let failed = response.failed();

        self.collector
            .record_request(tags.clone(), response.duration, failed, timestamp);
        self.requests += 1;

        REQUEST_STATUS_CODES
            .with_label_values(&[status_code_label(response.status)])
            .inc();
        REQUEST_DURATION_SECONDS.observe(response.duration.as_secs_f64());

        if let Some(category) = response.error_category() {
            REQUEST_ERRORS_BY_CATEGORY
                .with_label_values(&[category.label()])
                .inc();
            debug!(
                worker_id = self.worker_id,
                url = %url,
                status = ?response.status,
                error_category = %category,
                error = ?response.error.as_ref().map(|e| e.message.as_str()),
                "Request failed"
            );
        }

        Recorded { response, tags }
    }

    /// Record a check under the tags of the request it was evaluated against.
    pub fn check(&self, recorded: &Recorded, name: &str, passed: bool) {
        self.record_check(name, recorded.tags.clone(), passed);
    }

    fn record_check(&self, name: &str, tags: Arc<TagSet>, passed: bool) {
        self.collector.record_check(CheckResult {
            name: name.to_string(),
            tags,
            passed,
            timestamp: self.clock.elapsed(),
        });
    }

    /// Requests issued so far in this iteration.
    pub fn requests_issued(&self) -> usize {
        self.requests
    }
}

/// One declarative request with its tags and checks.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub name: String,
    pub method: Method,
    pub url: String,
    pub tags: TagSet,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub checks: Vec<Check>,
}

impl RequestSpec {
    pub fn get(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: Method::GET,
            url: url.into(),
            tags: TagSet::new(),
            body: None,
            headers: Vec::new(),
            timeout: None,
            checks: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    fn options(&self) -> RequestOptions {
        RequestOptions {
            tags: self.tags.clone(),
            timeout: self.timeout,
            body: self.body.clone(),
            headers: self.headers.clone(),
            capture_body: self.checks.iter().any(|c| c.kind.needs_body()),
        }
    }
}

/// Scenario that issues a fixed list of requests in order each iteration.
///
/// Request parameters are literal; nothing varies between iterations.
#[derive(Debug, Clone)]
pub struct RequestScenario {
    name: String,
    requests: Vec<RequestSpec>,
}

impl RequestScenario {
    pub fn new(name: impl Into<String>, requests: Vec<RequestSpec>) -> Self {
        Self {
            name: name.into(),
            requests,
        }
    }

    pub fn requests(&self) -> &[RequestSpec] {
        &self.requests
    }
}

#[async_trait]
impl Scenario for RequestScenario {
    fn name(&self) -> &str {
        &self.name
    }

    async fn iterate(&self, ctx: &mut IterationContext<'_>) -> Result<(), ScenarioError> {
        for spec in &self.requests {
            let recorded = ctx
                .request(spec.method.clone(), &spec.url, spec.options())
                .await;
            for (name, passed) in run_checks(&spec.checks, &recorded.response) {
                ctx.check(&recorded, name, passed);
            }
        }
        Ok(())
    }
}
