//! Run configuration: a YAML (or JSON) document using k6 option names.
//!
//! ```yaml
//! baseUrl: http://localhost:8080
//! scenarios:
//!   blast:
//!     executor: ramping-arrival-rate
//!     exec: submit_task
//!     startRate: 1000
//!     timeUnit: 1s
//!     stages:
//!       - { duration: 10s, target: 10000 }
//!       - { duration: 10s, target: 1000 }
//!     preAllocatedVUs: 500
//!     maxVUs: 1000
//! thresholds:
//!   http_req_duration: ["p(95)<500", "p(99)<1000"]
//!   http_req_failed: "rate<0.01"
//! metrics:
//!   submit_latency: trend
//! ```

use std::{collections::BTreeMap, fmt, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer, de};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    metric::{MetricKind, builtin},
    scenario::{DEFAULT_GRACEFUL_STOP, DEFAULT_TICK, ExecutorKind, Scenario, Schedule, Stage},
    script::{Iteration, Scripts},
    threshold::Thresholds,
};

/// Target used when neither the command line nor the config names one.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    pub scenarios: BTreeMap<String, ScenarioConfig>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdExprs>,
    /// Custom metrics referenced by thresholds, by kind.
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricKind>,
}

/// One scenario, flat like a k6 `options.scenarios` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioConfig {
    pub executor: ExecutorKind,
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub start_rate: Option<f64>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub time_unit: Option<ConfigDuration>,
    #[serde(default)]
    pub duration: Option<ConfigDuration>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(rename = "startVUs", default)]
    pub start_vus: Option<usize>,
    #[serde(default)]
    pub vus: Option<usize>,
    #[serde(rename = "preAllocatedVUs", default)]
    pub pre_allocated_vus: Option<usize>,
    #[serde(rename = "maxVUs", default)]
    pub max_vus: Option<usize>,
    #[serde(default)]
    pub graceful_stop: Option<ConfigDuration>,
    #[serde(default)]
    pub start_time: Option<ConfigDuration>,
    #[serde(default)]
    pub tick: Option<ConfigDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub duration: ConfigDuration,
    pub target: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdExprs {
    One(String),
    Many(Vec<String>),
}

impl ThresholdExprs {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(expr) => vec![expr],
            Self::Many(exprs) => exprs,
        }
    }
}

/// A duration written as `10s`, `500ms`, `1m30s` or a number of seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl de::Visitor<'_> for V {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("duration as string (e.g. 10s) or a number of seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(ConfigDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|v| ConfigDuration(Duration::from_secs(v)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
                Duration::try_from_secs_f64(v)
                    .map(ConfigDuration)
                    .map_err(|_| E::custom("duration must be a non-negative, finite number"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                humantime::parse_duration(v)
                    .map(ConfigDuration)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Command-line and environment settings that win over the config file.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct Overrides {
    #[builder(default, setter(strip_option, into))]
    pub base_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
    /// Ends the whole run after this duration. Scenarios are cut off at
    /// `duration - startTime`; those starting later are skipped.
    #[builder(default, setter(strip_option))]
    pub duration: Option<Duration>,
    #[builder(default, setter(strip_option))]
    pub tick: Option<Duration>,
}

/// A validated, ready-to-run configuration.
#[derive(Clone)]
pub struct Plan {
    pub base_url: String,
    pub seed: Option<u64>,
    pub scenarios: Vec<(Scenario, Arc<dyn Iteration>)>,
    pub thresholds: Thresholds,
    /// Every metric thresholds may reference, builtins excluded.
    pub metrics: BTreeMap<String, MetricKind>,
}

impl Plan {
    /// Wall-clock span of the plan: the latest scenario end.
    pub fn duration(&self) -> Duration {
        self.scenarios
            .iter()
            .map(|(s, _)| s.start_time + s.duration())
            .max()
            .unwrap_or_default()
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("base_url", &self.base_url)
            .field("seed", &self.seed)
            .field(
                "scenarios",
                &self.scenarios.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            )
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl RunConfig {
    /// Parses YAML. JSON documents are valid YAML and parse too.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let config = Self::from_yaml_str(&text)?;
        tracing::debug!(
            "Loaded {} scenarios from {}",
            config.scenarios.len(),
            path.display()
        );
        Ok(config)
    }

    /// Resolves and validates everything. No traffic is generated for a config that
    /// fails here.
    pub fn into_plan(self, scripts: &Scripts, overrides: &Overrides) -> Result<Plan> {
        if self.scenarios.is_empty() {
            return Err(Error::config("at least one scenario is required"));
        }

        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        for (name, config) in self.scenarios {
            let mut scenario = config.into_scenario(&name)?;
            if let Some(tick) = overrides.tick {
                scenario.tick = tick;
            }
            scenario.validate()?;
            let iteration = scripts.resolve(&scenario.exec)?;
            if let Some(cap) = overrides.duration {
                let remaining = cap.saturating_sub(scenario.start_time);
                if remaining.is_zero() {
                    tracing::warn!("Skipping scenario {name}: it starts after the {cap:?} cap");
                    continue;
                }
                scenario.schedule = scenario.schedule.truncated(remaining);
            }
            scenarios.push((scenario, iteration));
        }
        if scenarios.is_empty() {
            return Err(Error::config("no scenario starts before the duration cap"));
        }

        let mut metrics = scripts.declared_metrics().clone();
        for (name, kind) in self.metrics {
            if let Some(existing) = builtin::kind_of(&name).or(metrics.get(&name).copied()) {
                if existing != kind {
                    return Err(Error::MetricKind {
                        name,
                        actual: existing,
                        requested: kind,
                    });
                }
            }
            metrics.insert(name, kind);
        }

        let exprs = self
            .thresholds
            .into_iter()
            .map(|(metric, exprs)| (metric, exprs.into_vec()))
            .collect();
        let thresholds = Thresholds::parse(&exprs, |name| {
            builtin::kind_of(name).or_else(|| metrics.get(name).copied())
        })?;

        let base_url = overrides
            .base_url
            .clone()
            .or(self.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config(format!("base URL `{base_url}` is not http(s)")));
        }

        Ok(Plan {
            base_url,
            seed: overrides.seed.or(self.seed),
            scenarios,
            thresholds,
            metrics,
        })
    }
}

impl ScenarioConfig {
    fn into_scenario(self, name: &str) -> Result<Scenario> {
        let fail = |message: &str| Error::scenario(name, message);
        let seconds = |d: Option<ConfigDuration>| d.map(|d| d.0);

        let (schedule, pre_allocated, max) = match self.executor {
            ExecutorKind::RampingArrivalRate => {
                if self.stages.is_empty() {
                    return Err(fail("ramping-arrival-rate needs `stages`"));
                }
                let pre = self
                    .pre_allocated_vus
                    .ok_or_else(|| fail("`preAllocatedVUs` is required"))?;
                let schedule = Schedule::new(self.start_rate.unwrap_or(0.0), stages(&self.stages));
                (schedule, pre, self.max_vus.unwrap_or(pre))
            }
            ExecutorKind::ConstantArrivalRate => {
                let rate = self.rate.ok_or_else(|| fail("`rate` is required"))?;
                let duration =
                    seconds(self.duration).ok_or_else(|| fail("`duration` is required"))?;
                let pre = self
                    .pre_allocated_vus
                    .ok_or_else(|| fail("`preAllocatedVUs` is required"))?;
                (Schedule::constant(rate, duration), pre, self.max_vus.unwrap_or(pre))
            }
            ExecutorKind::RampingVus => {
                if self.stages.is_empty() {
                    return Err(fail("ramping-vus needs `stages`"));
                }
                let start = self.start_vus.unwrap_or(1);
                let schedule = Schedule::new(start as f64, stages(&self.stages));
                let peak = schedule.peak().ceil() as usize;
                (schedule, start, self.max_vus.unwrap_or(peak).max(1))
            }
            ExecutorKind::ConstantVus => {
                let vus = self.vus.unwrap_or(1);
                let duration =
                    seconds(self.duration).ok_or_else(|| fail("`duration` is required"))?;
                (Schedule::constant(vus as f64, duration), vus, vus)
            }
        };

        Ok(Scenario::builder()
            .name(name)
            .executor(self.executor)
            .schedule(schedule)
            .time_unit(seconds(self.time_unit).unwrap_or(Duration::from_secs(1)))
            .pre_allocated_vus(pre_allocated)
            .max_vus(max)
            .graceful_stop(seconds(self.graceful_stop).unwrap_or(DEFAULT_GRACEFUL_STOP))
            .start_time(seconds(self.start_time).unwrap_or_default())
            .exec(self.exec.unwrap_or_else(|| "default".to_string()))
            .tick(seconds(self.tick).unwrap_or(DEFAULT_TICK))
            .build())
    }
}

fn stages(config: &[StageConfig]) -> Vec<Stage> {
    config
        .iter()
        .map(|s| Stage::new(s.duration.0, s.target))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts;

    const TASK_QUEUE: &str = r#"
scenarios:
  blast:
    executor: ramping-arrival-rate
    timeUnit: 1s
    startRate: 1000
    stages:
      - { duration: 10s, target: 10000 }
      - { duration: 10s, target: 100000 }
      - { duration: 10s, target: 1000 }
    preAllocatedVUs: 5000
    maxVUs: 10000
    exec: submit_task
  readers:
    executor: constant-arrival-rate
    rate: 100
    timeUnit: 1s
    duration: 30s
    preAllocatedVUs: 50
    exec: list_tasks
thresholds:
  http_req_duration: ["p(95)<500", "p(99)<1000"]
  http_req_failed: "rate<0.01"
  submit_latency: ["p(95)<300"]
"#;

    fn plan(yaml: &str) -> Result<Plan> {
        RunConfig::from_yaml_str(yaml)?.into_plan(&scripts::builtin(), &Overrides::default())
    }

    #[test]
    fn parses_k6_style_scenarios() {
        let plan = plan(TASK_QUEUE).unwrap();
        let (blast, _) = &plan.scenarios[0];
        let (readers, _) = &plan.scenarios[1];

        assert_eq!(blast.name, "blast");
        assert_eq!(blast.schedule.start(), 1000.0);
        assert_eq!(blast.duration(), Duration::from_secs(30));
        assert_eq!((blast.pre_allocated_vus, blast.max_vus), (5000, 10000));
        assert_eq!(readers.exec, "list_tasks");
        // maxVUs falls back to preAllocatedVUs
        assert_eq!(readers.max_vus, 50);
        assert_eq!(readers.graceful_stop, DEFAULT_GRACEFUL_STOP);
        assert_eq!(plan.thresholds.len(), 4);
        assert_eq!(plan.base_url, DEFAULT_BASE_URL);
        assert_eq!(plan.duration(), Duration::from_secs(30));
    }

    #[test]
    fn ramping_vus_defaults_follow_the_stages() {
        let plan = plan(
            r#"
scenarios:
  shoppers:
    executor: ramping-vus
    exec: shop
    startVUs: 1
    gracefulStop: 10s
    stages:
      - { duration: 10s, target: 5 }
      - { duration: 30s, target: 5 }
      - { duration: 10s, target: 0 }
"#,
        )
        .unwrap();
        let (shoppers, _) = &plan.scenarios[0];

        assert_eq!((shoppers.pre_allocated_vus, shoppers.max_vus), (1, 5));
        assert_eq!(shoppers.graceful_stop, Duration::from_secs(10));
        assert_eq!(shoppers.duration(), Duration::from_secs(50));
    }

    #[test]
    fn durations_accept_numbers_and_strings() {
        let d: ConfigDuration = serde_yaml::from_str("1m30s").unwrap();
        assert_eq!(d.0, Duration::from_secs(90));
        let d: ConfigDuration = serde_yaml::from_str("2").unwrap();
        assert_eq!(d.0, Duration::from_secs(2));
        let d: ConfigDuration = serde_yaml::from_str("0.25").unwrap();
        assert_eq!(d.0, Duration::from_millis(250));
        assert!(serde_yaml::from_str::<ConfigDuration>("-1").is_err());
        assert!(serde_yaml::from_str::<ConfigDuration>("soon").is_err());
    }

    #[test]
    fn unknown_exec_fails_before_the_run() {
        let err = plan(
            r#"
scenarios:
  s:
    executor: constant-vus
    duration: 5s
    exec: nope
"#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::UnknownExec(name) if name == "nope"));
    }

    #[test]
    fn thresholds_on_unknown_metrics_fail() {
        let yaml = r#"
scenarios:
  s: { executor: constant-vus, duration: 5s }
thresholds:
  made_up: ["count>1"]
"#;
        assert!(matches!(plan(yaml), Err(Error::UnknownMetric(_))));

        let declared = format!("{yaml}metrics:\n  made_up: counter\n");
        assert!(plan(&declared).is_ok());
    }

    #[test]
    fn invalid_bounds_are_config_errors() {
        let err = plan(
            r#"
scenarios:
  s:
    executor: constant-arrival-rate
    rate: 10
    duration: 5s
    preAllocatedVUs: 20
    maxVUs: 10
"#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Scenario { .. }));
    }

    #[test]
    fn unknown_options_are_rejected() {
        let err = RunConfig::from_yaml_str(
            "scenarios:\n  s: { executor: constant-vus, duration: 5s, vu: 3 }\n",
        )
        .unwrap_err();

        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn overrides_win() {
        let overrides = Overrides::builder()
            .base_url("http://other:9000")
            .seed(9)
            .duration(Duration::from_secs(5))
            .tick(Duration::from_millis(50))
            .build();
        let plan = RunConfig::from_yaml_str(TASK_QUEUE)
            .unwrap()
            .into_plan(&scripts::builtin(), &overrides)
            .unwrap();

        assert_eq!(plan.base_url, "http://other:9000");
        assert_eq!(plan.seed, Some(9));
        for (scenario, _) in &plan.scenarios {
            assert_eq!(scenario.duration(), Duration::from_secs(5));
            assert_eq!(scenario.tick, Duration::from_millis(50));
        }
    }

    #[test]
    fn duration_cap_counts_from_the_run_start() {
        let config = RunConfig::from_yaml_str(
            r#"
scenarios:
  early: { executor: constant-vus, duration: 10s }
  delayed: { executor: constant-vus, duration: 10s, startTime: 2s }
  late: { executor: constant-vus, duration: 10s, startTime: 10s }
"#,
        )
        .unwrap();
        let overrides = Overrides::builder().duration(Duration::from_secs(5)).build();

        let plan = config.into_plan(&scripts::builtin(), &overrides).unwrap();

        let names: Vec<_> = plan.scenarios.iter().map(|(s, _)| s.name.as_str()).collect();
        assert_eq!(names, ["delayed", "early"]);
        assert_eq!(plan.scenarios[0].0.duration(), Duration::from_secs(3));
        assert_eq!(plan.duration(), Duration::from_secs(5));
    }

    #[test]
    fn duration_cap_before_every_start_is_an_error() {
        let config = RunConfig::from_yaml_str(
            "scenarios:\n  s: { executor: constant-vus, duration: 10s, startTime: 5s }\n",
        )
        .unwrap();
        let overrides = Overrides::builder().duration(Duration::from_secs(5)).build();

        let err = config.into_plan(&scripts::builtin(), &overrides).unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn json_documents_parse() {
        let config = RunConfig::from_yaml_str(
            r#"{
                "baseUrl": "https://api.test",
                "scenarios": {"s": {"executor": "constant-vus", "vus": 2, "duration": "1s"}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.base_url.as_deref(), Some("https://api.test"));
        assert_eq!(config.scenarios["s"].vus, Some(2));
    }
}
