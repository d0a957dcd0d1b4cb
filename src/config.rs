//! YAML test plans.
//!
//! A plan describes the stage profile, thresholds and the request scenario of
//! one run. Every struct rejects unknown fields, and validation collects all
//! problems with their field path before anything is spawned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;

use crate::checks::{Check, CheckKind};
use crate::client::Method;
use crate::config_validation::{
    DurationValidator, HttpMethodValidator, RangeValidator, UrlValidator, ValidationContext,
    ValidationError, ValidationResult,
};
use crate::runner::LoadTest;
use crate::scenario::{RequestScenario, RequestSpec};
use crate::scheduler::SchedulerConfig;
use crate::stages::{Stage, StageProfile};
use crate::tags::TagSet;
use crate::thresholds::{ThresholdEvaluator, ThresholdSpec};
use crate::worker::Pacing;

/// The only plan format version understood by this build.
pub const SUPPORTED_VERSION: &str = "1.0";

/// Errors that can occur when loading a test plan.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),
}

/// Duration as either whole seconds or a unit string ("30s", "5m", "2h").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    String(String),
}

impl YamlDuration {
    pub fn to_duration(&self) -> ValidationResult<Duration> {
        match self {
            YamlDuration::Seconds(s) => Ok(Duration::from_secs(*s)),
            YamlDuration::String(s) => DurationValidator::parse(s),
        }
    }

    pub fn to_positive_duration(&self) -> ValidationResult<Duration> {
        DurationValidator::require_positive(self.to_duration()?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlPacingRange {
    pub min: YamlDuration,
    pub max: YamlDuration,
}

/// Pause between iterations: fixed, or uniformly random in a range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlPacing {
    Fixed(YamlDuration),
    Random(YamlPacingRange),
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanConfig {
    #[serde(default = "default_pacing")]
    pub pacing: YamlPacing,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout: YamlDuration,

    /// Scheduler control tick
    #[serde(default = "default_tick")]
    pub tick: YamlDuration,

    #[serde(default = "default_abort_check_interval")]
    pub abort_check_interval: YamlDuration,

    /// Workers running at time zero, ramped from into the first stage
    #[serde(default = "default_start_target")]
    pub start_target: i64,

    /// Tags merged into every sample of the run
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_pacing() -> YamlPacing {
    YamlPacing::Fixed(YamlDuration::Seconds(1))
}

fn default_timeout() -> YamlDuration {
    YamlDuration::Seconds(60)
}

fn default_tick() -> YamlDuration {
    YamlDuration::Seconds(1)
}

fn default_abort_check_interval() -> YamlDuration {
    YamlDuration::Seconds(10)
}

fn default_start_target() -> i64 {
    1
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            pacing: default_pacing(),
            timeout: default_timeout(),
            tick: default_tick(),
            abort_check_interval: default_abort_check_interval(),
            start_target: default_start_target(),
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlStage {
    pub duration: YamlDuration,
    /// Signed so a negative target is reported with its field path
    pub target: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct YamlThresholdDetail {
    pub threshold: String,

    #[serde(default)]
    pub abort_on_fail: bool,

    pub delay_abort_eval: Option<YamlDuration>,
}

/// A threshold expression, either bare (`"p(95)<200"`) or with abort options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlThreshold {
    Expression(String),
    Detailed(YamlThresholdDetail),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", deny_unknown_fields)]
pub enum YamlCheck {
    StatusCode {
        name: String,
        expected: u16,
    },
    ResponseTime {
        name: String,
        max: YamlDuration,
    },
    BodyContains {
        name: String,
        text: String,
    },
    JsonPath {
        name: String,
        path: String,
        expected: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlRequest {
    pub name: String,

    #[serde(default = "default_method")]
    pub method: String,

    pub url: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    pub body: Option<String>,

    /// Overrides `config.timeout` for this request
    pub timeout: Option<YamlDuration>,

    #[serde(default)]
    pub checks: Vec<YamlCheck>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlScenario {
    pub name: String,
    pub requests: Vec<YamlRequest>,
}

/// Root of a YAML test plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestPlan {
    pub version: String,

    #[serde(default)]
    pub metadata: PlanMetadata,

    #[serde(default)]
    pub config: PlanConfig,

    pub stages: Vec<YamlStage>,

    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<YamlThreshold>>,

    pub scenario: YamlScenario,
}

impl TestPlan {
    /// Load a plan from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a plan from YAML text. Structure only; see [`TestPlan::to_load_test`].
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate every field and build the runnable test.
    pub fn to_load_test(&self) -> Result<LoadTest, ConfigError> {
        let mut ctx = ValidationContext::new();

        ctx.enter("version");
        if self.version != SUPPORTED_VERSION {
            ctx.field_error(format!(
                "Unsupported version '{}'. Supported versions: {}",
                self.version, SUPPORTED_VERSION
            ));
        }
        ctx.exit();

        ctx.enter("config");
        let pacing = self.validate_pacing(&mut ctx);
        let timeout = ctx.check_field("timeout", self.config.timeout.to_positive_duration());
        let tick = ctx.check_field("tick", self.config.tick.to_positive_duration());
        let abort_check_interval = ctx.check_field(
            "abortCheckInterval",
            self.config.abort_check_interval.to_positive_duration(),
        );
        ctx.enter("startTarget");
        let start_target = if self.config.start_target < 0 {
            ctx.field_error(format!(
                "Start target must be non-negative, got {}",
                self.config.start_target
            ));
            0
        } else {
            self.config.start_target as u64
        };
        ctx.exit();
        ctx.exit();

        let profile = self.validate_stages(&mut ctx, start_target);
        let thresholds = self.validate_thresholds(&mut ctx);
        let scenario = self.validate_scenario(&mut ctx);

        ctx.into_result()?;

        // Every None above recorded an error, so into_result already returned.
        let (Some(pacing), Some(timeout), Some(tick), Some(abort_check_interval), Some(profile), Some(scenario)) =
            (pacing, timeout, tick, abort_check_interval, profile, scenario)
        else {
            return Err(ConfigError::Validation(ValidationError::Multiple(
                "plan is incomplete".to_string(),
            )));
        };

        let name = self
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| self.scenario.name.clone());
        Ok(LoadTest::new(profile, Arc::new(scenario))
            .with_name(name)
            .with_thresholds(ThresholdEvaluator::new(thresholds))
            .with_pacing(pacing)
            .with_request_timeout(timeout)
            .with_scheduler_config(SchedulerConfig {
                tick,
                abort_check_interval,
            })
            .with_run_tags(TagSet::from_pairs(self.config.tags.clone())))
    }

    fn validate_pacing(&self, ctx: &mut ValidationContext) -> Option<Pacing> {
        ctx.enter("pacing");
        let pacing = match &self.config.pacing {
            YamlPacing::Fixed(d) => ctx.check(d.to_duration()).map(Pacing::Fixed),
            YamlPacing::Random(range) => {
                let min = ctx.check_field("min", range.min.to_duration());
                let max = ctx.check_field("max", range.max.to_duration());
                match (min, max) {
                    (Some(min), Some(max)) if min > max => {
                        ctx.field_error(format!(
                            "min ({:?}) must not be greater than max ({:?})",
                            min, max
                        ));
                        None
                    }
                    (Some(min), Some(max)) => Some(Pacing::Random { min, max }),
                    _ => None,
                }
            }
        };
        ctx.exit();
        pacing
    }

    fn validate_stages(&self, ctx: &mut ValidationContext, start_target: u64) -> Option<StageProfile> {
        ctx.enter("stages");
        if self.stages.is_empty() {
            ctx.field_error("At least one stage must be defined".to_string());
        }

        let mut stages = Vec::with_capacity(self.stages.len());
        for (idx, stage) in self.stages.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));
            let duration = ctx.check_field("duration", stage.duration.to_positive_duration());

            ctx.enter("target");
            let target = if stage.target < 0 {
                ctx.field_error(format!("Target must be non-negative, got {}", stage.target));
                None
            } else {
                Some(stage.target as u64)
            };
            ctx.exit();

            if let (Some(duration), Some(target)) = (duration, target) {
                stages.push(Stage::new(duration, target));
            }
            ctx.exit();
        }
        ctx.exit();

        if stages.len() != self.stages.len() || stages.is_empty() {
            return None;
        }
        match StageProfile::with_start_target(stages, start_target) {
            Ok(profile) => Some(profile),
            Err(e) => {
                ctx.add_error(e);
                None
            }
        }
    }

    fn validate_thresholds(&self, ctx: &mut ValidationContext) -> Vec<ThresholdSpec> {
        ctx.enter("thresholds");
        let mut specs = Vec::new();

        for (selector, expressions) in &self.thresholds {
            ctx.enter(selector);
            if expressions.is_empty() {
                ctx.field_error("At least one threshold expression is required".to_string());
            }

            for (idx, threshold) in expressions.iter().enumerate() {
                ctx.enter(&format!("[{}]", idx));
                let (expression, abort_on_fail, delay) = match threshold {
                    YamlThreshold::Expression(expr) => (expr.as_str(), false, None),
                    YamlThreshold::Detailed(detail) => (
                        detail.threshold.as_str(),
                        detail.abort_on_fail,
                        detail.delay_abort_eval.as_ref(),
                    ),
                };

                match ThresholdSpec::parse(selector, expression) {
                    Ok(spec) if abort_on_fail => {
                        let delay = match delay {
                            Some(d) => ctx.check_field("delayAbortEval", d.to_duration()),
                            None => Some(Duration::ZERO),
                        };
                        if let Some(delay) = delay {
                            specs.push(spec.with_abort(delay));
                        }
                    }
                    Ok(spec) => {
                        if delay.is_some() {
                            ctx.field_error("delayAbortEval requires abortOnFail: true".to_string());
                        }
                        specs.push(spec);
                    }
                    Err(e) => ctx.field_error(e.to_string()),
                }
                ctx.exit();
            }
            ctx.exit();
        }
        ctx.exit();
        specs
    }

    fn validate_scenario(&self, ctx: &mut ValidationContext) -> Option<RequestScenario> {
        ctx.enter("scenario");
        if self.scenario.name.trim().is_empty() {
            ctx.enter("name");
            ctx.field_error("Scenario name cannot be empty".to_string());
            ctx.exit();
        }

        ctx.enter("requests");
        if self.scenario.requests.is_empty() {
            ctx.field_error("At least one request must be defined".to_string());
        }

        let mut requests = Vec::with_capacity(self.scenario.requests.len());
        for (idx, request) in self.scenario.requests.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));
            if let Some(spec) = validate_request(request, ctx) {
                requests.push(spec);
            }
            ctx.exit();
        }
        ctx.exit();
        ctx.exit();

        if requests.len() != self.scenario.requests.len() || requests.is_empty() {
            return None;
        }
        Some(RequestScenario::new(self.scenario.name.clone(), requests))
    }
}

fn validate_request(request: &YamlRequest, ctx: &mut ValidationContext) -> Option<RequestSpec> {
    if request.name.trim().is_empty() {
        ctx.enter("name");
        ctx.field_error("Request name cannot be empty".to_string());
        ctx.exit();
    }

    let method = ctx
        .check_field("method", HttpMethodValidator::validate(&request.method))
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok());
    let url = ctx.check_field("url", UrlValidator::validate(&request.url));
    let timeout = match &request.timeout {
        Some(t) => ctx.check_field("timeout", t.to_positive_duration()).map(Some),
        None => Some(None),
    };

    ctx.enter("checks");
    let mut checks = Vec::with_capacity(request.checks.len());
    for (idx, check) in request.checks.iter().enumerate() {
        ctx.enter(&format!("[{}]", idx));
        if let Some(check) = convert_check(check, ctx) {
            checks.push(check);
        }
        ctx.exit();
    }
    ctx.exit();

    let (method, _, timeout) = (method?, url?, timeout?);
    if checks.len() != request.checks.len() {
        return None;
    }

    Some(RequestSpec {
        name: request.name.clone(),
        method,
        url: request.url.clone(),
        tags: TagSet::from_pairs(request.tags.clone()),
        body: request.body.clone(),
        headers: request.headers.clone().into_iter().collect(),
        timeout,
        checks,
    })
}

fn convert_check(check: &YamlCheck, ctx: &mut ValidationContext) -> Option<Check> {
    let name = match check {
        YamlCheck::StatusCode { name, .. }
        | YamlCheck::ResponseTime { name, .. }
        | YamlCheck::BodyContains { name, .. }
        | YamlCheck::JsonPath { name, .. } => name,
    };
    if name.trim().is_empty() {
        ctx.enter("name");
        ctx.field_error("Check name cannot be empty".to_string());
        ctx.exit();
        return None;
    }

    let kind = match check {
        YamlCheck::StatusCode { expected, .. } => ctx
            .check_field("expected", RangeValidator::validate_u16(*expected, 100, 599, "expected"))
            .map(|_| CheckKind::StatusCode(*expected)),
        YamlCheck::ResponseTime { max, .. } => ctx
            .check_field("max", max.to_positive_duration())
            .map(CheckKind::ResponseTime),
        YamlCheck::BodyContains { text, .. } => Some(CheckKind::BodyContains(text.clone())),
        YamlCheck::JsonPath { path, expected, .. } => {
            match serde_json_path::JsonPath::parse(path) {
                Ok(_) => Some(CheckKind::JsonPath {
                    path: path.clone(),
                    expected: expected.clone(),
                }),
                Err(e) => {
                    ctx.enter("path");
                    ctx.field_error(format!("Invalid JSONPath '{}': {}", path, e));
                    ctx.exit();
                    None
                }
            }
        }
    }?;

    Some(Check::new(name.clone(), kind))
}
