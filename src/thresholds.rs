//! Threshold parsing and evaluation.
//!
//! A threshold is declared as a selector and an expression:
//!
//! ```text
//! http_req_duration{endpoint:limit-offset}   p(95)<200
//! http_req_failed{endpoint=cursor-based}     rate<0.01
//! ```
//!
//! Evaluation filters the collector's samples by the selector's tag subset,
//! aggregates the matching values and compares against the bound. A selector
//! that matches nothing yields [`ThresholdOutcome::Indeterminate`], which fails
//! the run.

use regex::Regex;
use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

use crate::collector::{MetricKind, MetricsCollector};
use crate::percentiles::exact_percentile;
use crate::tags::TagSet;

lazy_static::lazy_static! {
    static ref SELECTOR_RE: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?:\{(.*)\})?\s*$").unwrap();

    static ref EXPRESSION_RE: Regex = Regex::new(
        r"^\s*(p\(\s*([0-9]+(?:\.[0-9]+)?)\s*\)|avg|min|max|med|count|rate)\s*(<=|>=|<|>)\s*(-?[0-9]+(?:\.[0-9]+)?)\s*$"
    ).unwrap();
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdParseError {
    #[error("Unknown metric '{0}'. Expected one of: http_req_duration, http_req_failed")]
    UnknownMetric(String),

    #[error("Malformed selector '{selector}': {reason}")]
    MalformedSelector { selector: String, reason: String },

    #[error("Malformed threshold expression '{0}'. Expected e.g. 'p(95)<200' or 'rate<0.01'")]
    MalformedExpression(String),

    #[error("Percentile {0} is out of range (must be between 0 and 100)")]
    InvalidPercentile(f64),

    #[error("Aggregation '{aggregation}' cannot be applied to metric '{metric}'")]
    IncompatibleAggregation { aggregation: String, metric: String },
}

/// How matching sample values are reduced to one number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// `p(N)`, exact with linear interpolation
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
    /// Mean of a 0/1 indicator
    Rate,
}

impl Aggregation {
    /// Whether this aggregation is meaningful for `metric`.
    pub fn applies_to(&self, metric: MetricKind) -> bool {
        match metric {
            MetricKind::HttpReqDuration => !matches!(self, Aggregation::Rate),
            MetricKind::HttpReqFailed => matches!(self, Aggregation::Rate | Aggregation::Count),
        }
    }

    /// Reduce `values`. None when there are no values.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        match self {
            Aggregation::Count => Some(n),
            Aggregation::Avg | Aggregation::Rate => Some(values.iter().sum::<f64>() / n),
            Aggregation::Min => Some(values.iter().copied().fold(f64::INFINITY, f64::min)),
            Aggregation::Max => Some(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            Aggregation::Med => exact_percentile(values, 50.0),
            Aggregation::Percentile(p) => exact_percentile(values, *p),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Percentile(p) => write!(f, "p({})", p),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Rate => f.write_str("rate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => observed < bound,
            Comparator::Le => observed <= bound,
            Comparator::Gt => observed > bound,
            Comparator::Ge => observed >= bound,
        }
    }

    fn parse(op: &str) -> Option<Self> {
        match op {
            "<" => Some(Comparator::Lt),
            "<=" => Some(Comparator::Le),
            ">" => Some(Comparator::Gt),
            ">=" => Some(Comparator::Ge),
            _ => None,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        })
    }
}

/// One parsed threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: MetricKind,
    pub filter: TagSet,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    pub bound: f64,

    /// Stop the run as soon as this threshold is breached
    pub abort_on_fail: bool,

    /// Do not consider aborting before this much run time has elapsed
    pub delay_abort_eval: Duration,
}

impl ThresholdSpec {
    /// Parse a selector (`metric{k:v}`) and an expression (`p(95)<200`).
    pub fn parse(selector: &str, expression: &str) -> Result<Self, ThresholdParseError> {
        let (metric, filter) = parse_selector(selector)?;

        let caps = EXPRESSION_RE
            .captures(expression)
            .ok_or_else(|| ThresholdParseError::MalformedExpression(expression.to_string()))?;

        let aggregation = match (&caps[1], caps.get(2)) {
            (_, Some(p)) => {
                let p: f64 = p
                    .as_str()
                    .parse()
                    .map_err(|_| ThresholdParseError::MalformedExpression(expression.to_string()))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(ThresholdParseError::InvalidPercentile(p));
                }
                Aggregation::Percentile(p)
            }
            ("avg", None) => Aggregation::Avg,
            ("min", None) => Aggregation::Min,
            ("max", None) => Aggregation::Max,
            ("med", None) => Aggregation::Med,
            ("count", None) => Aggregation::Count,
            ("rate", None) => Aggregation::Rate,
            _ => return Err(ThresholdParseError::MalformedExpression(expression.to_string())),
        };

        if !aggregation.applies_to(metric) {
            return Err(ThresholdParseError::IncompatibleAggregation {
                aggregation: aggregation.to_string(),
                metric: metric.to_string(),
            });
        }

        let comparator = Comparator::parse(&caps[3])
            .ok_or_else(|| ThresholdParseError::MalformedExpression(expression.to_string()))?;
        let bound: f64 = caps[4]
            .parse()
            .map_err(|_| ThresholdParseError::MalformedExpression(expression.to_string()))?;

        Ok(Self {
            metric,
            filter,
            aggregation,
            comparator,
            bound,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    pub fn with_abort(mut self, delay: Duration) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }

    /// `metric{tags}` as shown in reports.
    pub fn selector(&self) -> String {
        if self.filter.is_empty() {
            self.metric.to_string()
        } else {
            format!("{}{}", self.metric, self.filter)
        }
    }

    /// `p(95)<200`
    pub fn expression(&self) -> String {
        format!("{}{}{}", self.aggregation, self.comparator, self.bound)
    }

    /// Evaluate against the collector's current samples.
    ///
    /// Reads only, so repeated calls over the same samples give the same outcome.
    pub fn evaluate(&self, collector: &MetricsCollector) -> ThresholdOutcome {
        let values = collector.query(self.metric, &self.filter);
        match self.aggregation.apply(&values) {
            Some(observed) if self.comparator.holds(observed, self.bound) => {
                ThresholdOutcome::Pass { observed }
            }
            Some(observed) => ThresholdOutcome::Fail { observed },
            None => ThresholdOutcome::Indeterminate {
                diagnostic: format!(
                    "no {} samples matched filter {}",
                    self.metric, self.filter
                ),
            },
        }
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.selector(), self.expression())
    }
}

/// Split `metric{k:v,...}` into the metric and its tag filter.
pub fn parse_selector(selector: &str) -> Result<(MetricKind, TagSet), ThresholdParseError> {
    let caps = SELECTOR_RE
        .captures(selector)
        .ok_or_else(|| ThresholdParseError::MalformedSelector {
            selector: selector.to_string(),
            reason: "expected metric name optionally followed by {key:value,...}".to_string(),
        })?;

    let metric: MetricKind = caps[1]
        .parse()
        .map_err(|_| ThresholdParseError::UnknownMetric(caps[1].to_string()))?;

    let filter = match caps.get(2) {
        Some(body) => body
            .as_str()
            .parse::<TagSet>()
            .map_err(|e| ThresholdParseError::MalformedSelector {
                selector: selector.to_string(),
                reason: e.to_string(),
            })?,
        None => TagSet::new(),
    };

    Ok((metric, filter))
}

/// Result of evaluating one threshold.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdOutcome {
    Pass { observed: f64 },
    Fail { observed: f64 },
    /// The filter matched no samples
    Indeterminate { diagnostic: String },
}

impl ThresholdOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ThresholdOutcome::Pass { .. })
    }

    pub fn observed(&self) -> Option<f64> {
        match self {
            ThresholdOutcome::Pass { observed } | ThresholdOutcome::Fail { observed } => Some(*observed),
            ThresholdOutcome::Indeterminate { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ThresholdOutcome::Pass { .. } => "PASS",
            ThresholdOutcome::Fail { .. } => "FAIL",
            ThresholdOutcome::Indeterminate { .. } => "INDETERMINATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdResult {
    pub spec: ThresholdSpec,
    pub outcome: ThresholdOutcome,
}

impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            ThresholdOutcome::Indeterminate { diagnostic } => {
                write!(f, "{:<13} {} ({})", self.outcome.label(), self.spec, diagnostic)
            }
            outcome => write!(
                f,
                "{:<13} {} (observed {:.4})",
                outcome.label(),
                self.spec,
                outcome.observed().unwrap_or_default()
            ),
        }
    }
}

/// Overall run verdict: pass only if every threshold passed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Verdict {
    pub results: Vec<ThresholdResult>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.passed())
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ThresholdOutcome::Fail { .. }))
            .count()
    }

    pub fn indeterminate_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ThresholdOutcome::Indeterminate { .. }))
            .count()
    }
}

/// The full set of thresholds for a run.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    specs: Vec<ThresholdSpec>,
}

impl ThresholdEvaluator {
    pub fn new(specs: Vec<ThresholdSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ThresholdSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn has_abort_thresholds(&self) -> bool {
        self.specs.iter().any(|s| s.abort_on_fail)
    }

    pub fn evaluate(&self, collector: &MetricsCollector) -> Verdict {
        Verdict {
            results: self
                .specs
                .iter()
                .map(|spec| ThresholdResult {
                    spec: spec.clone(),
                    outcome: spec.evaluate(collector),
                })
                .collect(),
        }
    }

    /// First abort-on-fail threshold that is past its delay and currently failing.
    ///
    /// Indeterminate outcomes never abort.
    pub fn abort_breach(&self, collector: &MetricsCollector, elapsed: Duration) -> Option<ThresholdResult> {
        self.specs
            .iter()
            .filter(|spec| spec.abort_on_fail && elapsed >= spec.delay_abort_eval)
            .map(|spec| ThresholdResult {
                spec: spec.clone(),
                outcome: spec.evaluate(collector),
            })
            .find(|result| matches!(result.outcome, ThresholdOutcome::Fail { .. }))
    }
}
