//! Live operational metrics exposed in Prometheus format.
//!
//! These counters describe what the engine is doing right now (active workers,
//! request throughput). They are never read by the threshold evaluator, which
//! works exclusively from the samples in the [`MetricsCollector`](crate::collector::MetricsCollector).

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{error, info};

const METRIC_NAMESPACE: &str = "pagination_loadtest";

lazy_static::lazy_static! {
    // === Scheduler Metrics ===

    pub static ref ACTIVE_WORKERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("active_workers", "Number of workers currently running iterations")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    pub static ref TARGET_WORKERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("target_workers", "Target concurrency computed from the stage profile")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    pub static ref ITERATIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("iterations_total", "Total number of completed scenario iterations")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    // === Request Metrics ===

    pub static ref REQUEST_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total number of HTTP requests made")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of HTTP requests by status code")
                .namespace(METRIC_NAMESPACE),
            &["status_code"]
        ).unwrap();

    pub static ref REQUEST_ERRORS_BY_CATEGORY: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_failed_total", "Number of failed HTTP requests by error category")
                .namespace(METRIC_NAMESPACE),
            &["category"]
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "HTTP request latencies in seconds."
            ).namespace(METRIC_NAMESPACE)
        ).unwrap();
}

/// Registers all metrics with the given registry.
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(ACTIVE_WORKERS.clone()))?;
    registry.register(Box::new(TARGET_WORKERS.clone()))?;
    registry.register(Box::new(ITERATIONS_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(REQUEST_ERRORS_BY_CATEGORY.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Returns a static string label for common HTTP status codes.
///
/// Avoids a heap `String` allocation on every request in the hot path.
/// Uncommon codes fall back to "other" rather than allocating a unique string.
pub fn status_code_label(code: Option<u16>) -> &'static str {
    match code {
        None => "error",
        Some(200) => "200",
        Some(201) => "201",
        Some(204) => "204",
        Some(301) => "301",
        Some(302) => "302",
        Some(304) => "304",
        Some(400) => "400",
        Some(401) => "401",
        Some(403) => "403",
        Some(404) => "404",
        Some(408) => "408",
        Some(429) => "429",
        Some(500) => "500",
        Some(502) => "502",
        Some(503) => "503",
        Some(504) => "504",
        Some(_) => "other",
    }
}

/// Encodes every metric family in `registry` as Prometheus text.
pub fn gather_metrics_string(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn metrics_handler(_req: Request<Body>, registry: Registry) -> Result<Response<Body>, hyper::Error> {
    let response = match gather_metrics_string(&registry) {
        Ok(text) => {
            let mut res = Response::new(Body::from(text));
            if let Ok(content_type) = TextEncoder::new().format_type().parse() {
                res.headers_mut().insert(hyper::header::CONTENT_TYPE, content_type);
            }
            res
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            let mut res = Response::new(Body::from("failed to encode metrics"));
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            res
        }
    };
    Ok(response)
}

/// Serves `registry` on `0.0.0.0:port` until the task is dropped.
pub async fn start_metrics_server(port: u16, registry: Registry) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| metrics_handler(req, registry.clone())))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(port = port, addr = %addr, "Metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}
