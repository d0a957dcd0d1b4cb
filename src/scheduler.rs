//! Concurrency scheduler: turns a stage profile into a live worker count.
//!
//! On every control tick the scheduler reads the run clock, interpolates the
//! target from the profile and reconciles the [`WorkerPool`] to it. Once the
//! total profile duration has elapsed (or an abort threshold trips) the
//! target is forced to 0 and the scheduler waits for every worker to drain.

use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::TARGET_WORKERS;
use crate::stages::StageProfile;
use crate::thresholds::{ThresholdEvaluator, ThresholdResult};
use crate::utils::format_duration;
use crate::worker::{WorkerEnv, WorkerPool, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Control tick interval
    pub tick: Duration,

    /// How often abort-on-fail thresholds are checked
    pub abort_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            abort_check_interval: Duration::from_secs(10),
        }
    }
}

/// Target and live worker count observed at one control tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRecord {
    pub elapsed: Duration,
    pub target: usize,
    pub live: usize,
}

/// What the scheduler reports once all workers have drained.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    /// Run time at which the target was forced to 0
    pub scheduled: Duration,

    /// Run time once every worker had exited
    pub elapsed: Duration,

    pub peak_workers: usize,
    pub iterations: u64,
    pub workers: Vec<WorkerStats>,

    /// The threshold that stopped the run early, if any
    pub aborted: Option<ThresholdResult>,

    pub timeline: Vec<TickRecord>,
}

pub struct Scheduler {
    profile: StageProfile,
    config: SchedulerConfig,
    abort: Option<Arc<ThresholdEvaluator>>,
}

impl Scheduler {
    pub fn new(profile: StageProfile, config: SchedulerConfig) -> Self {
        Self {
            profile,
            config,
            abort: None,
        }
    }

    /// Check abort-on-fail thresholds while the run is in progress.
    pub fn with_abort_thresholds(mut self, evaluator: Arc<ThresholdEvaluator>) -> Self {
        if evaluator.has_abort_thresholds() {
            self.abort = Some(evaluator);
        }
        self
    }

    pub fn profile(&self) -> &StageProfile {
        &self.profile
    }

    /// Drive the run to completion.
    pub async fn run(&self, env: WorkerEnv) -> ScheduleOutcome {
        let clock = env.clock;
        let collector = env.collector.clone();
        let mut pool = WorkerPool::new(env);

        let total = self.profile.total_duration();
        let mut ticker = time::interval_at(clock.start_instant(), self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            stages = self.profile.stages().len(),
            total_duration = %format_duration(total),
            max_target = self.profile.max_target(),
            tick_ms = self.config.tick.as_millis() as u64,
            "Starting staged run"
        );

        let mut timeline = Vec::new();
        let mut current_stage = None;
        let mut next_abort_check = self.config.abort_check_interval;
        let mut aborted = None;

        loop {
            ticker.tick().await;
            let elapsed = clock.elapsed();
            if elapsed >= total {
                break;
            }

            let stage_idx = self.profile.stage_index_at(elapsed);
            if stage_idx != current_stage {
                if let Some(idx) = stage_idx {
                    let stage = self.profile.stages()[idx];
                    info!(
                        stage = idx + 1,
                        target = stage.target,
                        duration = %format_duration(stage.duration),
                        elapsed = %format_duration(elapsed),
                        "Entering stage"
                    );
                }
                current_stage = stage_idx;
            }

            let target = self.profile.target_workers_at(elapsed);
            let (started, stopped) = pool.scale_to(target).await;
            TARGET_WORKERS.set(target as i64);
            if started > 0 || stopped > 0 {
                info!(
                    target = target,
                    started = started,
                    stopped = stopped,
                    live = pool.live(),
                    draining = pool.draining(),
                    "Reconciled workers"
                );
            }
            timeline.push(TickRecord {
                elapsed,
                target,
                live: pool.live(),
            });

            if let Some(evaluator) = &self.abort {
                if elapsed >= next_abort_check {
                    next_abort_check = elapsed + self.config.abort_check_interval;
                    debug!(elapsed = %format_duration(elapsed), "Checking abort thresholds");
                    if let Some(breach) = evaluator.abort_breach(&collector, elapsed) {
                        warn!(
                            threshold = %breach.spec,
                            observed = ?breach.outcome.observed(),
                            elapsed = %format_duration(elapsed),
                            "Abort threshold breached, stopping run"
                        );
                        aborted = Some(breach);
                        break;
                    }
                }
            }
        }

        let scheduled = clock.elapsed();
        TARGET_WORKERS.set(0);
        info!(
            live = pool.live(),
            elapsed = %format_duration(scheduled),
            "Stage profile finished, draining workers"
        );
        let workers = pool.drain().await;
        let elapsed = clock.elapsed();
        info!(
            workers = workers.len(),
            iterations = pool.iterations(),
            elapsed = %format_duration(elapsed),
            "All workers drained"
        );

        ScheduleOutcome {
            scheduled,
            elapsed,
            peak_workers: pool.peak(),
            iterations: pool.iterations(),
            workers,
            aborted,
            timeline,
        }
    }
}
