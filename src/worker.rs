//! Worker iteration loops and the pool that owns them.
//!
//! A worker repeatedly runs the scenario and then pauses for the pacing
//! interval. Shutdown is cooperative: the pool flips the worker's watch
//! channel to `true` and the worker notices at its next iteration boundary,
//! after any pause already in progress. An in-flight request is never cancelled.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::client::HttpClient;
use crate::clock::RunClock;
use crate::collector::{CollectorHandle, MetricsCollector};
use crate::metrics::{ACTIVE_WORKERS, ITERATIONS_TOTAL};
use crate::scenario::{IterationContext, Scenario};
use crate::tags::TagSet;

/// Delay between two iterations of the same worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Fixed(Duration),

    /// Uniformly distributed in `min..=max`
    Random { min: Duration, max: Duration },
}

impl Pacing {
    pub fn next_delay(&self) -> Duration {
        match *self {
            Pacing::Fixed(delay) => delay,
            Pacing::Random { min, max } if max > min => {
                let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
                Duration::from_millis(ms)
            }
            Pacing::Random { min, .. } => min,
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::Fixed(Duration::from_secs(1))
    }
}

/// Everything a worker needs that is shared across the pool.
#[derive(Clone)]
pub struct WorkerEnv {
    pub scenario: Arc<dyn Scenario>,
    pub client: Arc<dyn HttpClient>,
    pub collector: Arc<MetricsCollector>,
    pub run_tags: Arc<TagSet>,
    pub pacing: Pacing,
    pub clock: RunClock,
}

/// What a worker reports when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub iterations: u64,
}

/// Runs one worker until its shutdown signal is observed at an iteration boundary.
pub async fn run_worker(
    worker_id: usize,
    env: WorkerEnv,
    collector: CollectorHandle,
    mut shutdown: watch::Receiver<bool>,
    iterations_total: Arc<AtomicU64>,
) -> WorkerStats {
    debug!(worker_id = worker_id, scenario = %env.scenario.name(), "Worker starting");
    ACTIVE_WORKERS.inc();

    let mut iteration: u64 = 0;
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        {
            let mut ctx = IterationContext::new(
                worker_id,
                iteration,
                env.client.as_ref(),
                &collector,
                &env.run_tags,
                env.clock,
            );
            if let Err(e) = env.scenario.iterate(&mut ctx).await {
                warn!(
                    worker_id = worker_id,
                    iteration = iteration,
                    error = %e,
                    "Scenario iteration returned an error"
                );
            }
        }
        iteration += 1;
        iterations_total.fetch_add(1, Ordering::Relaxed);
        ITERATIONS_TOTAL.inc();

        // Signalled during the iteration: skip the pause.
        if *shutdown.borrow_and_update() {
            break;
        }

        let delay = env.pacing.next_delay();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            time::sleep(delay).await;
        }
    }

    ACTIVE_WORKERS.dec();
    debug!(worker_id = worker_id, iterations = iteration, "Worker stopped");
    WorkerStats {
        worker_id,
        iterations: iteration,
    }
}

struct WorkerSlot {
    worker_id: usize,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<WorkerStats>,
}

/// The live set of workers.
///
/// Workers are kept in spawn order. Scaling down signals the most recently
/// spawned ones; they move to a draining list until their task finishes.
/// Scaling up first revives draining workers that have not exited yet, so
/// the number of running tasks never exceeds the highest target seen.
pub struct WorkerPool {
    env: WorkerEnv,
    live: Vec<WorkerSlot>,
    draining: Vec<WorkerSlot>,

    /// Statistics of workers already reaped from `draining`
    finished: Vec<WorkerStats>,

    next_id: usize,
    peak: usize,
    iterations: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(env: WorkerEnv) -> Self {
        Self {
            env,
            live: Vec::new(),
            draining: Vec::new(),
            finished: Vec::new(),
            next_id: 0,
            peak: 0,
            iterations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Workers that are running and not signalled.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Signalled workers whose task has not finished yet.
    pub fn draining(&self) -> usize {
        self.draining.iter().filter(|s| !s.handle.is_finished()).count()
    }

    /// Highest number of live workers seen.
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Iterations completed by all workers so far.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Bring the live count to `target`. Returns `(started, stopped)`.
    pub async fn scale_to(&mut self, target: usize) -> (usize, usize) {
        self.retire_exited();
        self.reap_finished().await;
        let current = self.live.len();
        let (mut started, mut stopped) = (0, 0);

        if target > current {
            for _ in current..target {
                let slot = match self.revive() {
                    Some(slot) => slot,
                    None => self.spawn(),
                };
                self.live.push(slot);
                started += 1;
            }
        } else {
            while self.live.len() > target {
                if let Some(slot) = self.live.pop() {
                    // A send error means the worker already exited.
                    let _ = slot.shutdown.send(true);
                    self.draining.push(slot);
                    stopped += 1;
                }
            }
        }

        self.peak = self.peak.max(self.live.len());
        (started, stopped)
    }

    fn spawn(&mut self) -> WorkerSlot {
        let worker_id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(
            worker_id,
            self.env.clone(),
            self.env.collector.handle(),
            rx,
            self.iterations.clone(),
        ));
        WorkerSlot {
            worker_id,
            shutdown: tx,
            handle,
        }
    }

    /// Take back the most recently signalled worker that is still running.
    fn revive(&mut self) -> Option<WorkerSlot> {
        let idx = self
            .draining
            .iter()
            .rposition(|slot| !slot.handle.is_finished())?;
        let slot = self.draining.remove(idx);
        // If it exits anyway, retire_exited picks it up on the next call.
        let _ = slot.shutdown.send(false);
        debug!(worker_id = slot.worker_id, "Reviving draining worker");
        Some(slot)
    }

    /// Move live workers whose task ended on its own out of the live set.
    fn retire_exited(&mut self) {
        let (exited, live): (Vec<_>, Vec<_>) = self
            .live
            .drain(..)
            .partition(|slot| slot.handle.is_finished());
        self.live = live;
        for slot in &exited {
            warn!(worker_id = slot.worker_id, "Worker exited without being signalled");
        }
        self.draining.extend(exited);
    }

    /// Drop draining workers whose task has ended, keeping their statistics.
    async fn reap_finished(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = self
            .draining
            .drain(..)
            .partition(|slot| slot.handle.is_finished());
        self.draining = running;
        for slot in done {
            // Already finished, so this does not wait.
            match slot.handle.await {
                Ok(s) => self.finished.push(s),
                Err(e) => warn!(worker_id = slot.worker_id, error = %e, "Worker task failed"),
            }
        }
    }

    /// Signal every worker and wait for all of them to exit.
    ///
    /// Returns the per-worker statistics in worker id order.
    pub async fn drain(&mut self) -> Vec<WorkerStats> {
        self.scale_to(0).await;

        let mut stats = std::mem::take(&mut self.finished);
        stats.reserve(self.draining.len());
        for slot in self.draining.drain(..) {
            match slot.handle.await {
                Ok(s) => stats.push(s),
                Err(e) => warn!(worker_id = slot.worker_id, error = %e, "Worker task failed"),
            }
        }
        stats.sort_by_key(|s| s.worker_id);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpResponse, Method, RequestOptions};
    use crate::collector::MetricKind;
    use crate::errors::ScenarioError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Fixed50ms;

    #[async_trait]
    impl HttpClient for Fixed50ms {
        async fn request(&self, _method: Method, _url: &str, _options: &RequestOptions) -> HttpResponse {
            time::sleep(Duration::from_millis(50)).await;
            HttpResponse::ok(200, Duration::from_millis(50))
        }
    }

    struct OneRequest;

    #[async_trait]
    impl Scenario for OneRequest {
        fn name(&self) -> &str {
            "one-request"
        }

        async fn iterate(&self, ctx: &mut IterationContext<'_>) -> Result<(), ScenarioError> {
            ctx.request(Method::GET, "http://app/", RequestOptions::default()).await;
            Ok(())
        }
    }

    /// Errors on every other iteration without issuing a request.
    struct Flaky(AtomicUsize);

    #[async_trait]
    impl Scenario for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn iterate(&self, ctx: &mut IterationContext<'_>) -> Result<(), ScenarioError> {
            if self.0.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(ScenarioError::Aborted("no data".to_string()));
            }
            ctx.request(Method::GET, "http://app/", RequestOptions::default()).await;
            Ok(())
        }
    }

    fn env(scenario: Arc<dyn Scenario>, pacing: Pacing) -> WorkerEnv {
        WorkerEnv {
            scenario,
            client: Arc::new(Fixed50ms),
            collector: Arc::new(MetricsCollector::new()),
            run_tags: Arc::new(TagSet::from_pairs([("test_type", "unit")])),
            pacing,
            clock: RunClock::start(),
        }
    }

    #[test]
    fn random_pacing_stays_in_range() {
        let pacing = Pacing::Random {
            min: Duration::from_millis(100),
            max: Duration::from_millis(200),
        };
        for _ in 0..100 {
            let d = pacing.next_delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
        assert_eq!(Pacing::default().next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_paces_iterations() {
        let env = env(Arc::new(OneRequest), Pacing::Fixed(Duration::from_secs(1)));
        let collector = env.collector.clone();
        let (tx, rx) = watch::channel(false);
        let counter = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run_worker(0, env, collector.handle(), rx, counter.clone()));

        // 50ms request + 1s pause per iteration: iterations start at 0, 1.05, 2.1, 3.15
        time::sleep(Duration::from_millis(3_500)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.iterations, 4);
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        assert_eq!(collector.query(MetricKind::HttpReqDuration, &TagSet::new()).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_iteration_skips_pause() {
        let env = env(Arc::new(OneRequest), Pacing::Fixed(Duration::from_secs(30)));
        let (tx, rx) = watch::channel(false);
        let handle = env.collector.handle();
        let start = time::Instant::now();

        let task = tokio::spawn(run_worker(0, env, handle, rx, Arc::new(AtomicU64::new(0))));
        time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.iterations, 1);
        // Finished the in-flight request but did not sleep 30s.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_pause_exits_after_pause() {
        let env = env(Arc::new(OneRequest), Pacing::Fixed(Duration::from_secs(30)));
        let (tx, rx) = watch::channel(false);
        let handle = env.collector.handle();
        let start = time::Instant::now();

        let task = tokio::spawn(run_worker(0, env, handle, rx, Arc::new(AtomicU64::new(0))));
        time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.iterations, 1);
        // 50ms request plus the full 30s pause, no second iteration.
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn revived_worker_keeps_pausing() {
        let env = env(Arc::new(OneRequest), Pacing::Fixed(Duration::from_secs(1)));
        let (tx, rx) = watch::channel(false);
        let handle = env.collector.handle();

        let task = tokio::spawn(run_worker(0, env, handle, rx, Arc::new(AtomicU64::new(0))));
        time::sleep(Duration::from_millis(500)).await;
        // Signal and revive before the worker observes the change.
        tx.send(true).unwrap();
        tx.send(false).unwrap();
        time::sleep(Duration::from_millis(1_200)).await;
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.iterations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_errors_do_not_stop_worker() {
        let env = env(Arc::new(Flaky(AtomicUsize::new(0))), Pacing::Fixed(Duration::from_millis(100)));
        let collector = env.collector.clone();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(run_worker(0, env, collector.handle(), rx, Arc::new(AtomicU64::new(0))));
        time::sleep(Duration::from_secs(2)).await;
        tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert!(stats.iterations >= 4);
        let requests = collector.query(MetricKind::HttpReqDuration, &TagSet::new()).len() as u64;
        assert_eq!(requests, stats.iterations / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_scales_up_and_down_lifo() {
        let mut pool = WorkerPool::new(env(Arc::new(OneRequest), Pacing::Fixed(Duration::from_secs(1))));

        assert_eq!(pool.scale_to(5).await, (5, 0));
        assert_eq!(pool.live(), 5);
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.scale_to(2).await, (0, 3));
        assert_eq!(pool.live(), 2);
        let ids: Vec<usize> = pool.live.iter().map(|s| s.worker_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(pool.draining(), 3);

        // Revives the draining workers instead of spawning fresh ones.
        assert_eq!(pool.scale_to(4).await, (2, 0));
        assert_eq!(pool.next_id, 5);
        assert_eq!(pool.peak(), 5);

        let stats = pool.drain().await;
        assert_eq!(stats.len(), 5);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.draining(), 0);
        assert!(pool.iterations() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn exited_workers_are_reaped_between_ticks() {
        let mut pool = WorkerPool::new(env(Arc::new(OneRequest), Pacing::Fixed(Duration::from_secs(1))));

        for cycle in 0..20 {
            assert_eq!(pool.scale_to(3).await, (3, 0), "cycle {}", cycle);
            time::sleep(Duration::from_millis(10)).await;
            assert_eq!(pool.scale_to(0).await, (0, 3), "cycle {}", cycle);
            time::sleep(Duration::from_secs(2)).await;
            assert!(pool.draining.len() <= 3, "cycle {}", cycle);
        }
        pool.scale_to(0).await;
        assert!(pool.draining.is_empty());
        assert_eq!(pool.finished.len(), 60);
        assert_eq!(pool.next_id, 60);

        let stats = pool.drain().await;
        assert_eq!(stats.len(), 60);
        assert!(stats.windows(2).all(|w| w[0].worker_id < w[1].worker_id));
        assert!(stats.iter().all(|s| s.iterations == 1));
    }
}
