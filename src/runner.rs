//! One complete load test: stage profile, scenario, thresholds and the run
//! that produces a verdict.

use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{error, info};

use crate::client::HttpClient;
use crate::clock::RunClock;
use crate::collector::MetricsCollector;
use crate::config::ConfigError;
use crate::config_validation::{ValidationContext, ValidationError};
use crate::scenario::Scenario;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::stages::StageProfile;
use crate::summary::RunSummary;
use crate::tags::TagSet;
use crate::thresholds::{ThresholdEvaluator, Verdict};
use crate::utils::format_duration;
use crate::worker::{Pacing, WorkerEnv};

/// Exit status of a passing run.
pub const EXIT_PASS: i32 = 0;

/// Exit status when any threshold failed or was indeterminate.
pub const EXIT_FAIL: i32 = 1;

/// Exit status for configuration errors, before anything ran.
pub const EXIT_CONFIG: i32 = 2;

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid load test: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl RunError {
    /// Every variant happens before the first worker starts.
    pub fn exit_code(&self) -> i32 {
        EXIT_CONFIG
    }
}

#[derive(Clone)]
pub struct LoadTest {
    pub name: String,
    pub profile: StageProfile,
    pub thresholds: ThresholdEvaluator,
    pub scenario: Arc<dyn Scenario>,
    pub pacing: Pacing,

    /// Per-request timeout the HTTP client is built with
    pub request_timeout: Duration,

    pub scheduler: SchedulerConfig,
    pub run_tags: TagSet,
}

impl std::fmt::Debug for LoadTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTest")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("thresholds", &self.thresholds)
            .field("pacing", &self.pacing)
            .field("request_timeout", &self.request_timeout)
            .field("scheduler", &self.scheduler)
            .field("run_tags", &self.run_tags)
            .finish_non_exhaustive()
    }
}

impl LoadTest {
    pub fn new(profile: StageProfile, scenario: Arc<dyn Scenario>) -> Self {
        Self {
            name: String::new(),
            profile,
            thresholds: ThresholdEvaluator::default(),
            scenario,
            pacing: Pacing::default(),
            request_timeout: Duration::from_secs(60),
            scheduler: SchedulerConfig::default(),
            run_tags: TagSet::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdEvaluator) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn with_run_tags(mut self, tags: TagSet) -> Self {
        self.run_tags = tags;
        self
    }

    /// Display name; falls back to the scenario name.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.scenario.name()
        } else {
            &self.name
        }
    }

    /// Checks the settings that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut ctx = ValidationContext::new();

        ctx.enter("tick");
        if self.scheduler.tick.is_zero() {
            ctx.field_error("Scheduler tick must be greater than zero".to_string());
        }
        ctx.exit();

        ctx.enter("abortCheckInterval");
        if self.scheduler.abort_check_interval.is_zero() {
            ctx.field_error("Abort check interval must be greater than zero".to_string());
        }
        ctx.exit();

        ctx.enter("pacing");
        if let Pacing::Random { min, max } = self.pacing {
            if min > max {
                ctx.field_error(format!(
                    "Pacing min ({}) must not exceed max ({})",
                    format_duration(min),
                    format_duration(max)
                ));
            }
        }
        ctx.exit();

        ctx.enter("timeout");
        if self.request_timeout.is_zero() {
            ctx.field_error("Request timeout must be greater than zero".to_string());
        }
        ctx.exit();

        ctx.into_result()
    }

    /// Execute the run and evaluate the thresholds once every worker has drained.
    pub async fn run(&self, client: Arc<dyn HttpClient>) -> Result<RunReport, RunError> {
        self.validate()?;

        let collector = Arc::new(MetricsCollector::new());
        let thresholds = Arc::new(self.thresholds.clone());
        let clock = RunClock::start();

        info!(
            name = %self.display_name(),
            scenario = %self.scenario.name(),
            thresholds = thresholds.specs().len(),
            run_tags = %self.run_tags,
            "Starting load test"
        );

        let env = WorkerEnv {
            scenario: self.scenario.clone(),
            client,
            collector: collector.clone(),
            run_tags: Arc::new(self.run_tags.clone()),
            pacing: self.pacing,
            clock,
        };

        let outcome = Scheduler::new(self.profile.clone(), self.scheduler)
            .with_abort_thresholds(thresholds.clone())
            .run(env)
            .await;

        let verdict = thresholds.evaluate(&collector);
        let aborted_by = outcome.aborted.as_ref().map(|breach| breach.spec.to_string());

        if verdict.passed() {
            info!(
                thresholds = verdict.results.len(),
                elapsed = %format_duration(outcome.elapsed),
                "All thresholds passed"
            );
        } else {
            error!(
                failed = verdict.failed_count(),
                indeterminate = verdict.indeterminate_count(),
                aborted = aborted_by.is_some(),
                "Thresholds not met"
            );
        }

        let summary = RunSummary::build(
            self.display_name(),
            &collector,
            &verdict,
            outcome.elapsed,
            outcome.iterations,
            outcome.peak_workers,
            aborted_by.clone(),
        );

        Ok(RunReport {
            verdict,
            summary,
            elapsed: outcome.elapsed,
            scheduled: outcome.scheduled,
            peak_workers: outcome.peak_workers,
            iterations: outcome.iterations,
            aborted: aborted_by,
            collector,
        })
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub verdict: Verdict,
    pub summary: RunSummary,

    /// Run time until the last worker exited
    pub elapsed: Duration,

    /// Run time at which the profile ended or the run was aborted
    pub scheduled: Duration,

    pub peak_workers: usize,
    pub iterations: u64,

    /// Threshold that stopped the run early
    pub aborted: Option<String>,

    pub collector: Arc<MetricsCollector>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            EXIT_PASS
        } else {
            EXIT_FAIL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpResponse, Method, RequestOptions};
    use crate::collector::MetricKind;
    use crate::errors::ScenarioError;
    use crate::scenario::IterationContext;
    use crate::stages::Stage;
    use crate::thresholds::ThresholdSpec;
    use async_trait::async_trait;
    use tokio::time;

    struct Ok200;

    #[async_trait]
    impl HttpClient for Ok200 {
        async fn request(&self, _method: Method, _url: &str, _options: &RequestOptions) -> HttpResponse {
            time::sleep(Duration::from_millis(30)).await;
            HttpResponse::ok(200, Duration::from_millis(30))
        }
    }

    struct Tagged;

    #[async_trait]
    impl Scenario for Tagged {
        fn name(&self) -> &str {
            "tagged"
        }

        async fn iterate(&self, ctx: &mut IterationContext<'_>) -> Result<(), ScenarioError> {
            let options = RequestOptions::tagged(TagSet::from_pairs([("endpoint", "limit-offset")]));
            let recorded = ctx.request(Method::GET, "http://app/", options).await;
            ctx.check(&recorded, "status is 200", recorded.response.status == Some(200));
            Ok(())
        }
    }

    fn test(secs: u64, target: u64) -> LoadTest {
        let profile = StageProfile::new(vec![Stage::new(Duration::from_secs(secs), target)]).unwrap();
        LoadTest::new(profile, Arc::new(Tagged))
    }

    #[test]
    fn display_name_falls_back_to_scenario() {
        assert_eq!(test(1, 1).display_name(), "tagged");
        assert_eq!(test(1, 1).with_name("load").display_name(), "load");
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let bad = test(1, 1)
            .with_pacing(Pacing::Random {
                min: Duration::from_secs(3),
                max: Duration::from_secs(1),
            })
            .with_scheduler_config(SchedulerConfig {
                tick: Duration::ZERO,
                abort_check_interval: Duration::from_secs(1),
            });
        let text = bad.validate().unwrap_err().to_string();
        assert!(text.contains("tick"));
        assert!(text.contains("pacing"));
        assert!(test(1, 1).validate().is_ok());
    }

    #[test]
    fn setup_failures_are_configuration_errors() {
        let registry = prometheus::Registry::new();
        crate::metrics::register_metrics(&registry).unwrap();
        let err = RunError::from(crate::metrics::register_metrics(&registry).unwrap_err());
        assert!(matches!(err, RunError::Metrics(_)));
        assert_eq!(err.exit_code(), EXIT_CONFIG);
        assert!(err.to_string().starts_with("Failed to register metrics"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_test_spawns_nothing() {
        let bad = test(10, 5).with_request_timeout(Duration::ZERO);
        let err = bad.run(Arc::new(Ok200)).await.unwrap_err();
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[tokio::test(start_paused = true)]
    async fn passing_run_reports_success() {
        let thresholds = ThresholdEvaluator::new(vec![
            ThresholdSpec::parse("http_req_duration{endpoint:limit-offset}", "p(95)<200").unwrap(),
            ThresholdSpec::parse("http_req_failed{endpoint:limit-offset}", "rate<0.01").unwrap(),
        ]);
        let report = test(10, 3)
            .with_thresholds(thresholds)
            .with_run_tags(TagSet::from_pairs([("test_type", "smoke")]))
            .run(Arc::new(Ok200))
            .await
            .unwrap();

        assert!(report.passed());
        assert_eq!(report.exit_code(), EXIT_PASS);
        assert_eq!(report.peak_workers, 3);
        assert!(report.iterations > 0);
        assert!(report.aborted.is_none());

        let tagged = report
            .collector
            .query(MetricKind::HttpReqDuration, &TagSet::from_pairs([("test_type", "smoke")]));
        assert!(!tagged.is_empty());
        assert_eq!(tagged.len(), report.collector.sample_count() / 2);
        assert!(report.summary.to_string().contains("verdict: PASS"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_tag_group_fails_the_run() {
        let thresholds = ThresholdEvaluator::new(vec![ThresholdSpec::parse(
            "http_req_duration{endpoint:cursor-based}",
            "p(95)<200",
        )
        .unwrap()]);
        let report = test(5, 1)
            .with_thresholds(thresholds)
            .run(Arc::new(Ok200))
            .await
            .unwrap();

        assert!(!report.passed());
        assert_eq!(report.exit_code(), EXIT_FAIL);
        assert_eq!(report.verdict.indeterminate_count(), 1);
        assert!(report.aborted.is_none());
    }
}
