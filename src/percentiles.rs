//! Latency statistics.
//!
//! Two flavours live here:
//! - [`exact_percentile`] works on the raw sample values and is what threshold
//!   evaluation uses, so a verdict never depends on histogram bucketing.
//! - [`LatencyHistogram`] is an HDR histogram used to build the summary table,
//!   where approximate values (3 significant digits) are fine.

use hdrhistogram::Histogram;
use std::collections::BTreeMap;
use tracing::warn;

/// Highest trackable latency, 60s in microseconds.
const MAX_LATENCY_US: u64 = 60_000_000;

/// Exact percentile of `values` using linear interpolation between the two
/// closest ranks. `p` is in `0.0..=100.0`.
///
/// Returns None for an empty input.
pub fn exact_percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(percentile_of_sorted(&sorted, p))
}

/// Like [`exact_percentile`] but on a slice that is already sorted ascending.
fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Percentile statistics for a set of latency measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileStats {
    /// Number of samples
    pub count: u64,

    /// Minimum value (microseconds)
    pub min: u64,

    /// Maximum value (microseconds)
    pub max: u64,

    /// Mean value (microseconds)
    pub mean: f64,

    /// 50th percentile - median (microseconds)
    pub p50: u64,

    /// 90th percentile (microseconds)
    pub p90: u64,

    /// 95th percentile (microseconds)
    pub p95: u64,

    /// 99th percentile (microseconds)
    pub p99: u64,
}

impl PercentileStats {
    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<40} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
            label,
            self.count,
            self.mean / 1000.0,
            self.min as f64 / 1000.0,
            self.p50 as f64 / 1000.0,
            self.p90 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.max as f64 / 1000.0,
        )
    }
}

/// HDR histogram over latencies, stored in microseconds.
///
/// Tracks 1µs to 60s with 3 significant digits. Values outside that range
/// are clamped.
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Result<Self, hdrhistogram::CreationError> {
        let histogram = Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)?;
        Ok(Self { histogram })
    }

    /// Build a histogram from millisecond sample values.
    pub fn from_millis(values: &[f64]) -> Result<Self, hdrhistogram::CreationError> {
        let mut hist = Self::new()?;
        for &ms in values {
            hist.record_ms(ms);
        }
        Ok(hist)
    }

    pub fn record_ms(&mut self, latency_ms: f64) {
        let latency_us = (latency_ms * 1000.0).round().max(0.0) as u64;
        self.record_us(latency_us);
    }

    pub fn record_us(&mut self, latency_us: u64) {
        let clamped = latency_us.clamp(1, MAX_LATENCY_US);
        if let Err(e) = self.histogram.record(clamped) {
            warn!(
                latency_us = latency_us,
                error = %e,
                "Failed to record latency in histogram"
            );
        }
    }

    /// Current statistics, or None if nothing was recorded.
    pub fn stats(&self) -> Option<PercentileStats> {
        let hist = &self.histogram;
        if hist.is_empty() {
            return None;
        }

        Some(PercentileStats {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
        })
    }
}

/// Format percentile statistics as a table, one row per label.
pub fn format_percentile_table(title: &str, stats_map: &BTreeMap<String, PercentileStats>) -> String {
    if stats_map.is_empty() {
        return format!("## {}\n\nNo data available.\n", title);
    }

    let mut output = String::new();
    output.push_str(&format!("\n## {}\n\n", title));
    output.push_str(&format!(
        "{:<40} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "Tags", "Count", "Avg", "Min", "P50", "P90", "P95", "P99", "Max"
    ));
    output.push_str(&format!(
        "{:<40} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "", "", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)"
    ));
    output.push_str(&"-".repeat(112));
    output.push('\n');

    for (label, stats) in stats_map {
        output.push_str(&stats.format_table_row(label));
        output.push('\n');
    }

    output
}
