use tokio::time::{Duration, Instant};

/// Monotonic run clock. The start instant is fixed when the run begins and
/// every component reads elapsed time from the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn start_instant(&self) -> Instant {
        self.start
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed_follows_tokio_time() {
        let clock = RunClock::start();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }
}
