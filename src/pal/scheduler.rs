//! Inter-run spacing for repeated plans.
//!
//! A plan with `totalruns > 1` is executed repeatedly. Before each run the
//! [`RunScheduler`] computes how long to sleep:
//!
//! - **linear**: `sampleperiod[run] - since_last_run - timeoffset`
//! - **geometric**: the target offset of run `n` is
//!   `spacingfactor^n * sampleperiod[n]`; the delay is the gap between the
//!   previous and current target minus `since_last_run` and `timeoffset`
//! - **custom**: `sampleperiod[run] - since_session_start - timeoffset`,
//!   i.e. `sampleperiod` holds absolute offsets
//!
//! Negative delays become zero; a late run never triggers a catch-up burst.
//! `sampleperiod` shorter than `totalruns` repeats its last entry.
//! Delays too long to represent are capped at [`Duration::MAX`].

use crate::error::{AppResult, WorkcellError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// How `sampleperiod` is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpacingMethod {
    /// Gap between run starts
    #[default]
    Linear,
    /// Gaps growing by `factor` per run
    Geometric,
    /// Absolute offsets from the session start
    Custom,
}

/// Spacing policy of a plan, periods and offset in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpacingPolicy {
    /// How `sampleperiod` is read
    #[serde(default)]
    pub method: SpacingMethod,
    /// Growth factor, geometric spacing only
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Periods or offsets in seconds, per run
    #[serde(default)]
    pub sampleperiod: Vec<f64>,
    /// Subtracted from every delay
    #[serde(default)]
    pub timeoffset: f64,
}

fn default_factor() -> f64 {
    1.0
}

impl Default for SpacingPolicy {
    fn default() -> Self {
        Self {
            method: SpacingMethod::Linear,
            factor: default_factor(),
            sampleperiod: Vec::new(),
            timeoffset: 0.0,
        }
    }
}

impl SpacingPolicy {
    /// Reject values that cannot produce a schedule for `totalruns` runs.
    pub fn validate(&self, totalruns: u32) -> AppResult<()> {
        if !self.factor.is_finite() || self.factor <= 0.0 {
            return Err(WorkcellError::NotAllowed(format!(
                "spacing factor {} must be finite and positive",
                self.factor
            )));
        }
        if let Some(bad) = self.sampleperiod.iter().find(|p| !p.is_finite() || **p < 0.0) {
            return Err(WorkcellError::NotAllowed(format!(
                "sample period {} must be finite and not negative",
                bad
            )));
        }
        if !self.timeoffset.is_finite() {
            return Err(WorkcellError::NotAllowed(format!(
                "time offset {} must be finite",
                self.timeoffset
            )));
        }
        let longest = self.sampleperiod.iter().copied().fold(0.0, f64::max);
        let bound = match self.method {
            SpacingMethod::Geometric => {
                let last = totalruns.saturating_sub(1) as f64;
                self.factor.max(1.0).powf(last) * longest
            }
            SpacingMethod::Linear | SpacingMethod::Custom => longest,
        };
        if Duration::try_from_secs_f64(bound).is_err() {
            return Err(WorkcellError::NotAllowed(format!(
                "spacing of {} run(s) reaches {:e} s",
                totalruns, bound
            )));
        }
        Ok(())
    }

    fn period(&self, run: usize) -> f64 {
        self.sampleperiod
            .get(run)
            .or_else(|| self.sampleperiod.last())
            .copied()
            .unwrap_or(0.0)
    }

    fn geometric_target(&self, run: usize) -> f64 {
        self.factor.powi(run as i32) * self.period(run)
    }

    /// Seconds to wait before `run`, possibly negative.
    pub fn raw_delay(&self, run: usize, since_last_run: Duration, since_start: Duration) -> f64 {
        match self.method {
            SpacingMethod::Linear => {
                self.period(run) - since_last_run.as_secs_f64() - self.timeoffset
            }
            SpacingMethod::Geometric => {
                let previous = if run == 0 {
                    0.0
                } else {
                    self.geometric_target(run - 1)
                };
                self.geometric_target(run) - previous - since_last_run.as_secs_f64() - self.timeoffset
            }
            SpacingMethod::Custom => {
                self.period(run) - since_start.as_secs_f64() - self.timeoffset
            }
        }
    }

    /// Delay before `run`, clamped at zero.
    pub fn delay(&self, run: usize, since_last_run: Duration, since_start: Duration) -> Duration {
        let secs = self.raw_delay(run, since_last_run, since_start);
        if secs.is_nan() || secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        }
    }
}

/// Tracks session timing for a running plan.
#[derive(Debug, Clone)]
pub struct RunScheduler {
    policy: SpacingPolicy,
    session_start: Instant,
    last_run: Instant,
}

impl RunScheduler {
    /// Scheduler for a session starting at `now`.
    pub fn new(policy: SpacingPolicy, now: Instant) -> Self {
        Self {
            policy,
            session_start: now,
            last_run: now,
        }
    }

    /// Delay before `run` as seen at `now`.
    pub fn delay_before(&self, run: usize, now: Instant) -> Duration {
        self.policy.delay(
            run,
            now.saturating_duration_since(self.last_run),
            now.saturating_duration_since(self.session_start),
        )
    }

    /// Record that a run started at `now`.
    pub fn mark_run_started(&mut self, now: Instant) {
        self.last_run = now;
    }
}
