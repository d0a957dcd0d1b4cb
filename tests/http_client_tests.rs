//! The reqwest-backed client and the declarative scenario against a mock server.

use std::sync::Arc;
use tokio::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pagination_loadtest::checks::{Check, CheckKind};
use pagination_loadtest::client::{build_client, ClientConfig, HttpClient, Method, RequestOptions};
use pagination_loadtest::collector::MetricKind;
use pagination_loadtest::errors::ErrorCategory;
use pagination_loadtest::runner::LoadTest;
use pagination_loadtest::scenario::{RequestScenario, RequestSpec};
use pagination_loadtest::scheduler::SchedulerConfig;
use pagination_loadtest::stages::{Stage, StageProfile};
use pagination_loadtest::tags::TagSet;
use pagination_loadtest::thresholds::{ThresholdEvaluator, ThresholdSpec};
use pagination_loadtest::worker::Pacing;

async fn pagination_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/limit-offset"))
        .and(query_param("page", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"data":[],"pagination":{"next":"2"}}"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/cursor-based"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_success_status_and_body() {
    let server = pagination_server().await;
    let client = build_client(&ClientConfig::default()).unwrap();

    let options = RequestOptions {
        capture_body: true,
        ..RequestOptions::default()
    };
    let url = format!("{}/users/limit-offset?page=1&limit=20", server.uri());
    let response = client.request(Method::GET, &url, &options).await;

    assert_eq!(response.status, Some(200));
    assert!(!response.failed());
    assert!(response.body.contains("pagination"));
}

#[tokio::test]
async fn test_server_error_is_failed_not_transport_error() {
    let server = pagination_server().await;
    let client = build_client(&ClientConfig::default()).unwrap();

    let url = format!("{}/users/cursor-based?cursor=22&limit=20", server.uri());
    let response = client.request(Method::GET, &url, &RequestOptions::default()).await;

    assert_eq!(response.status, Some(500));
    assert!(response.error.is_none());
    assert!(response.failed());
    assert_eq!(response.error_category(), Some(ErrorCategory::ServerError));
}

#[tokio::test]
async fn test_timeout_is_categorised() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = build_client(&ClientConfig::default().with_timeout(Duration::from_millis(50))).unwrap();
    let response = client
        .request(Method::GET, &server.uri(), &RequestOptions::default())
        .await;

    assert!(response.failed());
    assert_eq!(response.status, None);
    assert_eq!(response.error_category(), Some(ErrorCategory::TimeoutError));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let client = build_client(&ClientConfig::default().with_timeout(Duration::from_secs(2))).unwrap();
    let response = client
        .request(Method::GET, "http://127.0.0.1:1/", &RequestOptions::default())
        .await;

    assert!(response.failed());
    assert_eq!(response.error_category(), Some(ErrorCategory::NetworkError));
}

#[tokio::test]
async fn test_request_scenario_run_against_mock() {
    let server = pagination_server().await;
    let base = server.uri();

    let scenario = RequestScenario::new(
        "pagination",
        vec![
            RequestSpec::get("limit-offset", format!("{}/users/limit-offset?page=1&limit=20", base))
                .with_tags(TagSet::from_pairs([("endpoint", "limit-offset")]))
                .with_check(Check::status("limit-offset status is 200", 200))
                .with_check(Check::new(
                    "limit-offset has next page",
                    CheckKind::JsonPath {
                        path: "$.pagination.next".to_string(),
                        expected: Some("2".to_string()),
                    },
                )),
            RequestSpec::get("cursor-based", format!("{}/users/cursor-based?cursor=22&limit=20", base))
                .with_tags(TagSet::from_pairs([("endpoint", "cursor-based")]))
                .with_check(Check::status("cursor-based status is 200", 200)),
        ],
    );

    let profile = StageProfile::with_start_target(vec![Stage::new(Duration::from_secs(2), 2)], 2).unwrap();
    let thresholds = ThresholdEvaluator::new(vec![
        ThresholdSpec::parse("http_req_failed{endpoint:limit-offset}", "rate<0.01").unwrap(),
        ThresholdSpec::parse("http_req_failed{endpoint:cursor-based}", "rate<0.01").unwrap(),
    ]);

    let report = LoadTest::new(profile, Arc::new(scenario))
        .with_thresholds(thresholds)
        .with_pacing(Pacing::Fixed(Duration::from_millis(200)))
        .with_scheduler_config(SchedulerConfig {
            tick: Duration::from_millis(100),
            abort_check_interval: Duration::from_secs(1),
        })
        .with_run_tags(TagSet::from_pairs([("test_type", "smoke")]))
        .run(Arc::new(build_client(&ClientConfig::default()).unwrap()))
        .await
        .unwrap();

    assert!(!report.passed());
    assert_eq!(report.verdict.failed_count(), 1);
    assert!(report.verdict.results[0].outcome.passed());

    let checks = &report.summary.checks;
    assert_eq!(checks["limit-offset status is 200"].fails, 0);
    assert_eq!(checks["limit-offset has next page"].fails, 0);
    assert_eq!(checks["cursor-based status is 200"].passes, 0);

    let cursor = report.collector.query(
        MetricKind::HttpReqFailed,
        &TagSet::from_pairs([("endpoint", "cursor-based"), ("test_type", "smoke")]),
    );
    assert!(!cursor.is_empty());
    assert!(cursor.iter().all(|v| *v == 1.0));
}
