//! Human-readable end-of-run summary.

use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Duration;
use tracing::warn;

use crate::collector::{CheckCounts, MetricKind, MetricsCollector};
use crate::percentiles::{format_percentile_table, LatencyHistogram, PercentileStats};
use crate::tags::TagSet;
use crate::thresholds::{ThresholdResult, Verdict};
use crate::utils::format_duration;

/// Failed-request tally for one tag group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedTally {
    pub failed: u64,
    pub total: u64,
}

impl FailedTally {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Aggregated view of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub name: String,
    pub elapsed: Duration,
    pub iterations: u64,
    pub peak_workers: usize,

    /// Latency statistics per exact tag set
    pub durations: BTreeMap<TagSet, PercentileStats>,

    /// Failed-request rate per exact tag set
    pub failures: BTreeMap<TagSet, FailedTally>,

    /// Pass/fail counts per check name
    pub checks: BTreeMap<String, CheckCounts>,

    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
    pub aborted_by: Option<String>,
}

impl RunSummary {
    pub fn build(
        name: &str,
        collector: &MetricsCollector,
        verdict: &Verdict,
        elapsed: Duration,
        iterations: u64,
        peak_workers: usize,
        aborted_by: Option<String>,
    ) -> Self {
        let mut durations = BTreeMap::new();
        for (tags, values) in collector.tag_groups(MetricKind::HttpReqDuration) {
            match LatencyHistogram::from_millis(&values) {
                Ok(hist) => {
                    if let Some(stats) = hist.stats() {
                        durations.insert(tags, stats);
                    }
                }
                Err(e) => warn!(tags = %tags, error = %e, "Failed to create latency histogram"),
            }
        }

        let failures = collector
            .tag_groups(MetricKind::HttpReqFailed)
            .into_iter()
            .map(|(tags, values)| {
                let failed = values.iter().filter(|v| **v > 0.0).count() as u64;
                (
                    tags,
                    FailedTally {
                        failed,
                        total: values.len() as u64,
                    },
                )
            })
            .collect();

        Self {
            name: name.to_string(),
            elapsed,
            iterations,
            peak_workers,
            durations,
            failures,
            checks: collector.check_counts(&TagSet::new()),
            thresholds: verdict.results.clone(),
            passed: verdict.passed(),
            aborted_by,
        }
    }

    /// Total requests across every tag group.
    pub fn total_requests(&self) -> u64 {
        self.failures.values().map(|t| t.total).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Run summary: {}", self.name)?;
        writeln!(f)?;
        writeln!(f, "elapsed:      {}", format_duration(self.elapsed))?;
        writeln!(f, "iterations:   {}", self.iterations)?;
        writeln!(f, "peak workers: {}", self.peak_workers)?;
        writeln!(f, "requests:     {}", self.total_requests())?;
        if let Some(reason) = &self.aborted_by {
            writeln!(f, "aborted:      {}", reason)?;
        }

        let labelled: BTreeMap<String, PercentileStats> = self
            .durations
            .iter()
            .map(|(tags, stats)| (tags.to_string(), stats.clone()))
            .collect();
        write!(f, "{}", format_percentile_table(MetricKind::HttpReqDuration.name(), &labelled))?;

        writeln!(f, "\n## {}\n", MetricKind::HttpReqFailed)?;
        if self.failures.is_empty() {
            writeln!(f, "No data available.")?;
        }
        for (tags, tally) in &self.failures {
            writeln!(
                f,
                "{:<40} {:>7.2}%  ({} of {})",
                tags.to_string(),
                tally.rate() * 100.0,
                tally.failed,
                tally.total
            )?;
        }

        if !self.checks.is_empty() {
            writeln!(f, "\n## checks\n")?;
            for (name, counts) in &self.checks {
                let mark = if counts.fails == 0 { "✓" } else { "✗" };
                writeln!(
                    f,
                    "{} {:<45} {} passed, {} failed",
                    mark, name, counts.passes, counts.fails
                )?;
            }
        }

        writeln!(f, "\n## thresholds\n")?;
        if self.thresholds.is_empty() {
            writeln!(f, "No thresholds configured.")?;
        }
        for result in &self.thresholds {
            writeln!(f, "{}", result)?;
        }

        writeln!(f)?;
        writeln!(f, "verdict: {}", if self.passed { "PASS" } else { "FAIL" })
    }
}
