//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{self, Duration};

use pagination_loadtest::client::{HttpClient, HttpResponse, Method, RequestOptions};
use pagination_loadtest::errors::ScenarioError;
use pagination_loadtest::scenario::{IterationContext, Scenario};
use pagination_loadtest::tags::TagSet;

/// Answers every request after a fixed latency; every `fail_every`-th request returns 503.
pub struct FakeService {
    pub latency: Duration,
    pub fail_every: Option<u64>,
    pub calls: AtomicU64,
}

impl FakeService {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            latency,
            fail_every: None,
            calls: AtomicU64::new(0),
        }
    }

    pub fn failing_every(latency: Duration, n: u64) -> Self {
        Self {
            latency,
            fail_every: Some(n),
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl HttpClient for FakeService {
    async fn request(&self, _method: Method, _url: &str, _options: &RequestOptions) -> HttpResponse {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        time::sleep(self.latency).await;
        match self.fail_every {
            Some(n) if call % n == 0 => HttpResponse::ok(503, self.latency),
            _ => HttpResponse::ok(200, self.latency),
        }
    }
}

/// Issues one GET per iteration tagged with the given endpoint.
pub struct EndpointScenario {
    pub endpoint: &'static str,
}

#[async_trait]
impl Scenario for EndpointScenario {
    fn name(&self) -> &str {
        "endpoint"
    }

    async fn iterate(&self, ctx: &mut IterationContext<'_>) -> Result<(), ScenarioError> {
        let options = RequestOptions::tagged(TagSet::from_pairs([("endpoint", self.endpoint)]));
        let recorded = ctx
            .request(Method::GET, "http://app:3030/users/limit-offset?page=1&limit=20", options)
            .await;
        let name = format!("{} status is 200", self.endpoint);
        ctx.check(&recorded, &name, recorded.response.status == Some(200));
        Ok(())
    }
}
