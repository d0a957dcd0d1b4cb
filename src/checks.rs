//! Named boolean checks evaluated against a response.
//!
//! Checks are purely observational: a false outcome is recorded and counted,
//! it never fails the request or stops the worker.

use serde_json::Value;
use thiserror::Error;
use tokio::time::Duration;
use tracing::debug;

use crate::client::HttpResponse;

/// What a check asserts about a response.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckKind {
    /// Response status equals the expected code
    StatusCode(u16),

    /// Request completed within the limit
    ResponseTime(Duration),

    /// Body contains the substring
    BodyContains(String),

    /// JSONPath matches exactly one node, optionally with the expected value
    JsonPath {
        path: String,
        expected: Option<String>,
    },
}

impl CheckKind {
    /// True when evaluating this check needs the response body.
    pub fn needs_body(&self) -> bool {
        matches!(self, CheckKind::BodyContains(_) | CheckKind::JsonPath { .. })
    }
}

/// A named check, e.g. `"limit-offset status is 200"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
}

impl Check {
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn status(name: impl Into<String>, expected: u16) -> Self {
        Self::new(name, CheckKind::StatusCode(expected))
    }
}

/// Why a check came out false.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Status code mismatch: expected {expected}, got {actual}")]
    StatusCodeMismatch { expected: u16, actual: String },

    #[error("Response time {actual_ms}ms exceeds limit {limit_ms}ms")]
    ResponseTimeTooSlow { actual_ms: u128, limit_ms: u128 },

    #[error("Body does not contain expected substring: {0}")]
    BodyNotContains(String),

    #[error("JSONPath check failed: {0}")]
    JsonPathFailed(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

/// Evaluate one check against a response.
pub fn evaluate(kind: &CheckKind, response: &HttpResponse) -> Result<(), CheckError> {
    match kind {
        CheckKind::StatusCode(expected) => match response.status {
            Some(actual) if actual == *expected => Ok(()),
            Some(actual) => Err(CheckError::StatusCodeMismatch {
                expected: *expected,
                actual: actual.to_string(),
            }),
            None => Err(CheckError::StatusCodeMismatch {
                expected: *expected,
                actual: "no response".to_string(),
            }),
        },

        CheckKind::ResponseTime(limit) => {
            if response.duration <= *limit {
                Ok(())
            } else {
                Err(CheckError::ResponseTimeTooSlow {
                    actual_ms: response.duration.as_millis(),
                    limit_ms: limit.as_millis(),
                })
            }
        }

        CheckKind::BodyContains(substring) => {
            if response.body.contains(substring.as_str()) {
                Ok(())
            } else {
                Err(CheckError::BodyNotContains(substring.clone()))
            }
        }

        CheckKind::JsonPath { path, expected } => {
            check_json_path(&response.body, path, expected.as_deref())
        }
    }
}

fn check_json_path(json_body: &str, path: &str, expected: Option<&str>) -> Result<(), CheckError> {
    use serde_json_path::JsonPath;

    let json: Value =
        serde_json::from_str(json_body).map_err(|e| CheckError::InvalidJson(e.to_string()))?;

    let json_path = JsonPath::parse(path)
        .map_err(|e| CheckError::JsonPathFailed(format!("Invalid JSONPath '{}': {}", path, e)))?;

    let value = json_path.query(&json).exactly_one().map_err(|_| {
        CheckError::JsonPathFailed(format!("JSONPath '{}' did not match exactly one value", path))
    })?;

    let Some(expected_value) = expected else {
        return Ok(());
    };

    let actual = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if actual == expected_value {
        Ok(())
    } else {
        Err(CheckError::JsonPathFailed(format!(
            "JSONPath '{}' value mismatch: expected '{}', got '{}'",
            path, expected_value, actual
        )))
    }
}

/// Evaluate every check, returning `(name, passed)` pairs in order.
pub fn run_checks<'a>(checks: &'a [Check], response: &HttpResponse) -> Vec<(&'a str, bool)> {
    checks
        .iter()
        .map(|check| {
            let passed = match evaluate(&check.kind, response) {
                Ok(()) => true,
                Err(e) => {
                    debug!(check = %check.name, error = %e, "Check failed");
                    false
                }
            };
            (check.name.as_str(), passed)
        })
        .collect()
}
