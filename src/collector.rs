//! Tagged sample collection shared by all workers.
//!
//! The collector is partitioned into shards. Every worker registers its own
//! shard at spawn time and appends to it through a [`CollectorHandle`], so the
//! per-request hot path only ever takes an uncontended lock. Queries walk all
//! shards and merge lazily. Samples are never discarded during a run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::time::Duration;

use crate::tags::TagSet;

/// Built-in metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    /// Elapsed time of one request, in milliseconds
    HttpReqDuration,

    /// 1.0 when a request failed, 0.0 otherwise
    HttpReqFailed,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::HttpReqDuration => "http_req_duration",
            MetricKind::HttpReqFailed => "http_req_failed",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "http_req_duration" => Ok(MetricKind::HttpReqDuration),
            "http_req_failed" => Ok(MetricKind::HttpReqFailed),
            other => Err(format!(
                "Unknown metric '{}'. Expected one of: http_req_duration, http_req_failed",
                other
            )),
        }
    }
}

/// One immutable observation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: MetricKind,
    pub tags: Arc<TagSet>,
    pub value: f64,
    /// Offset from run start
    pub timestamp: Duration,
}

/// Outcome of one named check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub tags: Arc<TagSet>,
    pub passed: bool,
    pub timestamp: Duration,
}

/// Pass/fail tallies for one check name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckCounts {
    pub passes: u64,
    pub fails: u64,
}

impl CheckCounts {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }
}

#[derive(Debug, Default)]
struct Shard {
    samples: Vec<Sample>,
    checks: Vec<CheckResult>,
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only, sharded sink for samples and check results.
#[derive(Debug)]
pub struct MetricsCollector {
    shards: RwLock<Vec<Arc<Mutex<Shard>>>>,
    /// Number of shared shards used by [`MetricsCollector::record_sample`]
    shared: usize,
    next_shared: AtomicUsize,
}

impl MetricsCollector {
    /// Create a collector with a default number of shared shards.
    pub fn new() -> Self {
        Self::with_shared_shards(16)
    }

    /// Create a collector with `shared` shards for callers without a handle.
    pub fn with_shared_shards(shared: usize) -> Self {
        let shared = shared.max(1);
        let shards = (0..shared)
            .map(|_| Arc::new(Mutex::new(Shard::default())))
            .collect();
        Self {
            shards: RwLock::new(shards),
            shared,
            next_shared: AtomicUsize::new(0),
        }
    }

    /// Register a dedicated shard and return a handle that appends to it.
    pub fn handle(&self) -> CollectorHandle {
        let shard = Arc::new(Mutex::new(Shard::default()));
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(shard.clone());
        CollectorHandle { shard }
    }

    fn shared_shard(&self) -> Arc<Mutex<Shard>> {
        let idx = self.next_shared.fetch_add(1, Ordering::Relaxed) % self.shared;
        self.shards.read().unwrap_or_else(PoisonError::into_inner)[idx].clone()
    }

    /// Append a sample through one of the shared shards.
    pub fn record_sample(&self, sample: Sample) {
        lock(&self.shared_shard()).samples.push(sample);
    }

    /// Append a check result through one of the shared shards.
    pub fn record_check(&self, check: CheckResult) {
        lock(&self.shared_shard()).checks.push(check);
    }

    fn snapshot_shards(&self) -> Vec<Arc<Mutex<Shard>>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Values of every `metric` sample whose tags contain `filter`.
    pub fn query(&self, metric: MetricKind, filter: &TagSet) -> Vec<f64> {
        let mut values = Vec::new();
        for shard in self.snapshot_shards() {
            let shard = lock(&shard);
            values.extend(
                shard
                    .samples
                    .iter()
                    .filter(|s| s.metric == metric && s.tags.matches(filter))
                    .map(|s| s.value),
            );
        }
        values
    }

    /// Values of `metric` grouped by their exact tag set.
    pub fn tag_groups(&self, metric: MetricKind) -> BTreeMap<TagSet, Vec<f64>> {
        let mut groups: BTreeMap<TagSet, Vec<f64>> = BTreeMap::new();
        for shard in self.snapshot_shards() {
            let shard = lock(&shard);
            for sample in shard.samples.iter().filter(|s| s.metric == metric) {
                groups
                    .entry(sample.tags.as_ref().clone())
                    .or_default()
                    .push(sample.value);
            }
        }
        groups
    }

    /// Pass/fail counts per check name for checks whose tags contain `filter`.
    pub fn check_counts(&self, filter: &TagSet) -> BTreeMap<String, CheckCounts> {
        let mut counts: BTreeMap<String, CheckCounts> = BTreeMap::new();
        for shard in self.snapshot_shards() {
            let shard = lock(&shard);
            for check in shard.checks.iter().filter(|c| c.tags.matches(filter)) {
                let entry = counts.entry(check.name.clone()).or_default();
                if check.passed {
                    entry.passes += 1;
                } else {
                    entry.fails += 1;
                }
            }
        }
        counts
    }

    /// Total number of samples across all metrics and shards.
    pub fn sample_count(&self) -> usize {
        self.snapshot_shards()
            .iter()
            .map(|s| lock(s).samples.len())
            .sum()
    }

    /// Total number of recorded check results.
    pub fn check_count(&self) -> usize {
        self.snapshot_shards()
            .iter()
            .map(|s| lock(s).checks.len())
            .sum()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker append path into a dedicated shard.
#[derive(Debug)]
pub struct CollectorHandle {
    shard: Arc<Mutex<Shard>>,
}

impl CollectorHandle {
    pub fn record_sample(&self, sample: Sample) {
        lock(&self.shard).samples.push(sample);
    }

    pub fn record_check(&self, check: CheckResult) {
        lock(&self.shard).checks.push(check);
    }

    /// Record the duration and failed-indicator pair for one request under one lock.
    pub fn record_request(&self, tags: Arc<TagSet>, duration: Duration, failed: bool, timestamp: Duration) {
        let mut shard = lock(&self.shard);
        shard.samples.push(Sample {
            metric: MetricKind::HttpReqDuration,
            tags: tags.clone(),
            value: duration.as_secs_f64() * 1000.0,
            timestamp,
        });
        shard.samples.push(Sample {
            metric: MetricKind::HttpReqFailed,
            tags,
            value: if failed { 1.0 } else { 0.0 },
            timestamp,
        });
    }
}
