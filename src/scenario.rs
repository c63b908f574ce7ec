//! Scenarios and their piecewise-linear schedules.
//!
//! A [`Schedule`] starts at a value and walks through [`Stage`]s. Each stage moves the
//! value linearly from wherever the previous stage ended to its own `target` over its
//! `duration`. For arrival-rate executors the value is iterations per `time_unit`; for
//! VU executors it is the number of concurrently looping virtual users.
//!
//! A stage with `Duration::ZERO` is an instantaneous jump: it takes no time and the
//! next stage starts from its target.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Dispatch tick used when a scenario does not set one.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// In-flight iterations get this long to finish once a scenario ends.
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// A stage defines a target value and how long to ramp to it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stage {
    pub duration: Duration,
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Schedule {
    start: f64,
    stages: Vec<Stage>,
}

impl Schedule {
    pub fn new(start: f64, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    /// Holds `value` for `duration`.
    pub fn constant(value: f64, duration: Duration) -> Self {
        Self::new(value, vec![Stage::new(duration, value)])
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Highest value the schedule ever reaches.
    pub fn peak(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, f64::max)
    }

    /// Instantaneous value at `t`. Past the end the last target holds.
    pub fn value_at(&self, t: Duration) -> f64 {
        let t = t.as_secs_f64();
        let mut from = self.start;
        let mut offset = 0.0;
        for stage in &self.stages {
            let duration = stage.duration.as_secs_f64();
            if duration > 0.0 && t < offset + duration {
                return lerp(from, stage.target, (t - offset) / duration);
            }
            offset += duration;
            from = stage.target;
        }
        from
    }

    /// Exact integral of the schedule over `[from, to]`, in value-seconds.
    ///
    /// Nothing is accumulated past the end of the last stage.
    pub fn integral(&self, from: Duration, to: Duration) -> f64 {
        let (a, b) = (from.as_secs_f64(), to.as_secs_f64());
        if b <= a {
            return 0.0;
        }

        let mut area = 0.0;
        let mut v0 = self.start;
        let mut s0 = 0.0;
        for stage in &self.stages {
            let s1 = s0 + stage.duration.as_secs_f64();
            let v1 = stage.target;
            if s1 > s0 {
                let (x0, x1) = (a.max(s0), b.min(s1));
                if x1 > x0 {
                    let at = |x: f64| lerp(v0, v1, (x - s0) / (s1 - s0));
                    area += (at(x0) + at(x1)) * 0.5 * (x1 - x0);
                }
            }
            if s1 >= b {
                break;
            }
            s0 = s1;
            v0 = v1;
        }
        area
    }

    /// Index of the stage running at `t`, `None` once the schedule is over.
    pub fn stage_index_at(&self, t: Duration) -> Option<usize> {
        let mut offset = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            offset += stage.duration;
            if t < offset {
                return Some(i);
            }
        }
        None
    }

    /// Same curve, cut off at `cap`. The last kept stage ends at the value the
    /// full curve has at `cap`.
    pub fn truncated(&self, cap: Duration) -> Self {
        let mut stages = Vec::new();
        let mut offset = Duration::ZERO;
        for stage in &self.stages {
            if offset + stage.duration <= cap {
                stages.push(*stage);
                offset += stage.duration;
                continue;
            }
            let remaining = cap - offset;
            if !remaining.is_zero() {
                stages.push(Stage::new(remaining, self.value_at(cap)));
            }
            break;
        }
        Self::new(self.start, stages)
    }
}

fn lerp(from: f64, to: f64, t: f64) -> f64 {
    from + (to - from) * t.clamp(0.0, 1.0)
}

/// How a scenario turns its schedule into iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Open model, arrivals follow the schedule.
    RampingArrivalRate,
    /// Open model, fixed arrival rate.
    ConstantArrivalRate,
    /// Closed model, the number of looping VUs follows the schedule.
    RampingVus,
    /// Closed model, fixed number of looping VUs.
    ConstantVus,
}

impl ExecutorKind {
    /// Open-model executors start iterations independently of completions.
    pub fn is_arrival_rate(self) -> bool {
        matches!(self, Self::RampingArrivalRate | Self::ConstantArrivalRate)
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RampingArrivalRate => "ramping-arrival-rate",
            Self::ConstantArrivalRate => "constant-arrival-rate",
            Self::RampingVus => "ramping-vus",
            Self::ConstantVus => "constant-vus",
        })
    }
}

/// A fully resolved scenario. Immutable once the run starts.
///
/// ```rust
/// use std::time::Duration;
/// use volley::scenario::{ExecutorKind, Scenario, Schedule, Stage};
///
/// let scenario = Scenario::builder()
///     .name("submit")
///     .executor(ExecutorKind::RampingArrivalRate)
///     .schedule(Schedule::new(10.0, vec![Stage::new(Duration::from_secs(30), 50.0)]))
///     .pre_allocated_vus(50)
///     .max_vus(200)
///     .exec("submit_task")
///     .build();
///
/// assert!(scenario.validate().is_ok());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub executor: ExecutorKind,
    pub schedule: Schedule,
    /// Period the arrival rate is expressed in.
    #[builder(default = Duration::from_secs(1))]
    pub time_unit: Duration,
    /// VUs created before the scenario starts.
    #[builder(default = 1)]
    pub pre_allocated_vus: usize,
    /// Hard cap on concurrently active VUs.
    pub max_vus: usize,
    #[builder(default = DEFAULT_GRACEFUL_STOP)]
    pub graceful_stop: Duration,
    /// Offset from the run start.
    #[builder(default)]
    pub start_time: Duration,
    /// Name of the iteration function.
    #[builder(default = "default".to_string(), setter(into))]
    pub exec: String,
    #[builder(default = DEFAULT_TICK)]
    pub tick: Duration,
}

impl Scenario {
    pub fn duration(&self) -> Duration {
        self.schedule.total_duration()
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(Error::scenario(&self.name, message));

        if self.max_vus == 0 {
            return fail("maxVUs must be greater than zero");
        }
        if self.pre_allocated_vus > self.max_vus {
            return fail(&format!(
                "preAllocatedVUs ({}) exceeds maxVUs ({})",
                self.pre_allocated_vus, self.max_vus
            ));
        }
        let values = std::iter::once(self.schedule.start)
            .chain(self.schedule.stages.iter().map(|s| s.target));
        for value in values {
            if !value.is_finite() || value < 0.0 {
                return fail(&format!("stage target {value} must be a non-negative number"));
            }
        }
        if self.duration().is_zero() {
            return fail("total duration must be greater than zero");
        }
        if self.time_unit.is_zero() {
            return fail("timeUnit must be greater than zero");
        }
        if self.tick.is_zero() {
            return fail("tick must be greater than zero");
        }
        Ok(())
    }
}
