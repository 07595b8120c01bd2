//! Stage scheduler: turns a list of ramp stages into a target virtual-user
//! count for any instant of the run.

use std::time::Duration;

use crate::cli::config::{ConfigError, ScheduleStep};
use crate::utils::parse_duration_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }

    pub fn from_step(step: &ScheduleStep) -> Result<Self, ConfigError> {
        let duration = parse_duration_str(&step.duration)?;
        let target =
            usize::try_from(step.target).map_err(|_| ConfigError::NegativeTarget(step.target))?;
        Ok(Self { duration, target })
    }
}

/// Stage `i` ramps linearly from the end target of stage `i - 1` (or from
/// `start_target` for the first stage) to its own target.
#[derive(Debug, Clone)]
pub struct StageScheduler {
    start_target: usize,
    stages: Vec<Stage>,
    total: Duration,
}

impl StageScheduler {
    pub fn new(start_target: usize, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        let total = stages
            .iter()
            .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration))
            .ok_or_else(|| {
                ConfigError::InvalidDuration("total schedule duration overflows".into())
            })?;
        Ok(Self {
            start_target,
            stages,
            total,
        })
    }

    pub fn from_steps(start_target: i64, steps: &[ScheduleStep]) -> Result<Self, ConfigError> {
        let start_target =
            usize::try_from(start_target).map_err(|_| ConfigError::NegativeTarget(start_target))?;
        let stages = steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                Stage::from_step(step).map_err(|e| ConfigError::Stage {
                    index,
                    source: Box::new(e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(start_target, stages)
    }

    /// Target concurrency `elapsed` after test start.
    ///
    /// Interpolation is done in integer nanoseconds and truncates toward the
    /// stage's start target. Zero-length stages are skipped over, so their
    /// target applies immediately. Past the end the last target holds.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut stage_start = Duration::ZERO;
        let mut from = self.start_target;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_nanos() as i128;
                let span = stage.duration.as_nanos() as i128;
                let diff = stage.target as i128 - from as i128;
                return (from as i128 + diff * progress / span) as usize;
            }
            stage_start = stage_end;
            from = stage.target;
        }
        from
    }

    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.total
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn max_target(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_target, usize::max)
    }

    pub fn start_target(&self) -> usize {
        self.start_target
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}
