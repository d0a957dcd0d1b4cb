//! Stage profiles: the desired concurrency shape of a run over time.
//!
//! A profile is an ordered list of stages executed back to back. Each stage
//! ramps linearly from the previous stage's end target (or the profile's start
//! target for the first stage) to its own target over its duration.

use tokio::time::Duration;

use crate::config_validation::ValidationError;

/// A timed segment of a run with a target concurrency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    /// Number of concurrent workers to reach by the end of the stage
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

/// Immutable, validated sequence of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProfile {
    stages: Vec<Stage>,
    start_target: u64,
    total: Duration,
}

impl StageProfile {
    /// Builds a profile that ramps up from zero workers.
    pub fn new(stages: Vec<Stage>) -> Result<Self, ValidationError> {
        Self::with_start_target(stages, 0)
    }

    /// Builds a profile whose first stage ramps from `start_target`.
    pub fn with_start_target(stages: Vec<Stage>, start_target: u64) -> Result<Self, ValidationError> {
        if stages.is_empty() {
            return Err(ValidationError::FieldError {
                field: "stages".to_string(),
                message: "At least one stage must be defined".to_string(),
            });
        }

        let mut total = Duration::ZERO;
        for (idx, stage) in stages.iter().enumerate() {
            if stage.duration.is_zero() {
                return Err(ValidationError::OutOfRange {
                    field: format!("stages.[{}].duration", idx),
                    value: "0s".to_string(),
                    min: "1ms".to_string(),
                    max: "unlimited".to_string(),
                });
            }
            total = total
                .checked_add(stage.duration)
                .ok_or_else(|| ValidationError::OutOfRange {
                    field: "stages".to_string(),
                    value: format!("stage {} pushes the total duration past the maximum", idx + 1),
                    min: "1ms".to_string(),
                    max: format!("{}s", Duration::MAX.as_secs()),
                })?;
        }

        Ok(Self {
            stages,
            start_target,
            total,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_target(&self) -> u64 {
        self.start_target
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest concurrency the profile ever asks for.
    pub fn max_target(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, u64::max)
    }

    /// Index of the stage active at `elapsed`, or None once the run is over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_start = Duration::ZERO;
        for (idx, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                return Some(idx);
            }
            stage_start = stage_end;
        }
        None
    }

    /// Instantaneous (fractional) target concurrency at `elapsed`.
    ///
    /// Within a stage the value is interpolated linearly between the previous
    /// stage's target and this stage's target. Past the end of the profile the
    /// target is 0.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut from = self.start_target as f64;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let into_stage = elapsed - stage_start;
                return linear_interpolate(
                    from,
                    stage.target as f64,
                    into_stage.as_secs_f64(),
                    stage.duration.as_secs_f64(),
                );
            }
            from = stage.target as f64;
            stage_start = stage_end;
        }

        0.0
    }

    /// Whole number of workers that should be live at `elapsed`.
    pub fn target_workers_at(&self, elapsed: Duration) -> usize {
        self.target_at(elapsed).round().max(0.0) as usize
    }
}

fn linear_interpolate(from: f64, to: f64, elapsed: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return to;
    }
    from + (to - from) * (elapsed / duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn profile(stages: &[(u64, u64)]) -> StageProfile {
        StageProfile::new(stages.iter().map(|(d, t)| Stage::new(secs(*d), *t)).collect()).unwrap()
    }

    #[test]
    fn total_duration_is_sum_of_stages() {
        let p = profile(&[(300, 50), (1200, 50), (60, 0)]);
        assert_eq!(p.total_duration(), secs(1560));
    }

    #[test]
    fn ramps_linearly_from_zero() {
        let p = profile(&[(100, 50)]);
        assert_eq!(p.target_at(secs(0)), 0.0);
        assert_eq!(p.target_at(secs(50)), 25.0);
        assert_eq!(p.target_workers_at(secs(99)), 50);
    }

    #[test]
    fn next_stage_starts_from_previous_target() {
        let p = profile(&[(10, 100), (10, 0)]);
        assert_eq!(p.target_at(secs(10)), 100.0);
        assert_eq!(p.target_at(secs(15)), 50.0);
    }

    #[test]
    fn hold_stage_keeps_target() {
        let p = profile(&[(10, 40), (60, 40)]);
        assert_eq!(p.target_at(secs(30)), 40.0);
        assert_eq!(p.target_at(secs(69)), 40.0);
    }

    #[test]
    fn non_monotonic_profiles_are_supported() {
        let p = profile(&[(10, 20), (10, 0), (10, 30)]);
        assert_eq!(p.target_at(secs(15)), 10.0);
        assert_eq!(p.target_at(secs(25)), 15.0);
        assert_eq!(p.max_target(), 30);
    }

    #[test]
    fn target_is_zero_after_profile_ends() {
        let p = profile(&[(10, 20)]);
        assert_eq!(p.target_at(secs(10)), 0.0);
        assert_eq!(p.target_at(secs(1000)), 0.0);
        assert_eq!(p.stage_index_at(secs(10)), None);
    }

    #[test]
    fn zero_target_profile_is_legal() {
        let p = profile(&[(5, 0)]);
        assert_eq!(p.target_workers_at(secs(2)), 0);
        assert_eq!(p.max_target(), 0);
    }

    #[test]
    fn start_target_seeds_first_stage() {
        let p = StageProfile::with_start_target(vec![Stage::new(secs(10), 11)], 1).unwrap();
        assert_eq!(p.target_at(secs(0)), 1.0);
        assert_eq!(p.target_at(secs(5)), 6.0);
    }

    #[test]
    fn stage_index_tracks_boundaries() {
        let p = profile(&[(10, 1), (20, 2)]);
        assert_eq!(p.stage_index_at(secs(0)), Some(0));
        assert_eq!(p.stage_index_at(secs(10)), Some(1));
        assert_eq!(p.stage_index_at(secs(29)), Some(1));
    }

    #[test]
    fn rejects_empty_profile() {
        assert!(StageProfile::new(vec![]).is_err());
    }

    #[test]
    fn rejects_total_duration_overflow() {
        let huge = Duration::from_secs(u64::MAX);
        let err = StageProfile::new(vec![Stage::new(huge, 1), Stage::new(huge, 0)]).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { ref field, .. } if field == "stages"));

        let single = StageProfile::new(vec![Stage::new(huge, 1)]).unwrap();
        assert_eq!(single.total_duration(), huge);
        assert_eq!(single.stage_index_at(secs(10)), Some(0));
    }

    #[test]
    fn rejects_zero_duration_stage() {
        let err = StageProfile::new(vec![Stage::new(secs(10), 5), Stage::new(Duration::ZERO, 1)])
            .unwrap_err();
        assert!(err.to_string().contains("stages.[1].duration"), "error was: {}", err);
    }
}
