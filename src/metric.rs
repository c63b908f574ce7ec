//! Run-scoped metric registry.
//!
//! A metric is a named series of samples with a fixed [`MetricKind`]. Metrics are
//! created on first reference and live until the run ends. Each metric is split into
//! shards guarded by their own lock; writers are pinned to a shard, so concurrent
//! virtual users rarely contend, and [`Registry::snapshot`] merges the shards into a
//! frozen [`RunSnapshot`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    aggregate::{Aggregate, CounterAggregate, RateAggregate, TrendAggregate},
    error::{Error, Result},
};

/// The kind of a metric decides how its samples are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic running total.
    Counter,
    /// Distribution of values, queryable by percentile.
    Trend,
    /// Fraction of samples that were true.
    Rate,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Trend => "trend",
            Self::Rate => "rate",
        })
    }
}

/// Names of the metrics every run records.
pub mod builtin {
    use super::MetricKind;

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const ABANDONED_ITERATIONS: &str = "abandoned_iterations";
    pub const CHECKS: &str = "checks";
    /// Recorded by [`Vu::end_group`](crate::Vu::end_group), only once groups are used.
    pub const GROUP_DURATION: &str = "group_duration";

    pub const ALL: &[(&str, MetricKind)] = &[
        (HTTP_REQS, MetricKind::Counter),
        (HTTP_REQ_FAILED, MetricKind::Rate),
        (HTTP_REQ_DURATION, MetricKind::Trend),
        (ITERATIONS, MetricKind::Counter),
        (ITERATION_DURATION, MetricKind::Trend),
        (ITERATION_ERRORS, MetricKind::Counter),
        (DROPPED_ITERATIONS, MetricKind::Counter),
        (ABANDONED_ITERATIONS, MetricKind::Counter),
        (CHECKS, MetricKind::Rate),
    ];

    pub fn kind_of(name: &str) -> Option<MetricKind> {
        if is_group_duration(name) {
            return Some(MetricKind::Trend);
        }
        ALL.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
    }

    /// The `group_duration` submetric of one group, e.g. `group_duration{group:::checkout}`.
    pub fn group_duration(group: &str) -> String {
        format!("{GROUP_DURATION}{{group:::{group}}}")
    }

    fn is_group_duration(name: &str) -> bool {
        name == GROUP_DURATION
            || name
                .strip_prefix(GROUP_DURATION)
                .and_then(|rest| rest.strip_prefix("{group:::"))
                .is_some_and(|rest| rest.ends_with('}'))
    }
}

/// A single observed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Counter(f64),
    Trend(f64),
    Rate(bool),
}

impl Value {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Trend(_) => MetricKind::Trend,
            Self::Rate(_) => MetricKind::Rate,
        }
    }

    /// Counters only grow and trends hold non-negative magnitudes.
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Counter(v) | Self::Trend(v) => v.is_finite() && v >= 0.0,
            Self::Rate(_) => true,
        }
    }
}

/// A value plus the moment it was emitted. Written once, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub value: Value,
    pub at: Instant,
}

impl Sample {
    pub fn now(value: Value) -> Self {
        Self {
            value,
            at: Instant::now(),
        }
    }
}

/// Aggregated values of one metric, either a single shard or a merged snapshot.
#[derive(Debug, Clone)]
pub enum MetricValues {
    Counter(CounterAggregate),
    Trend(TrendAggregate),
    Rate(RateAggregate),
}

impl MetricValues {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterAggregate::new()),
            MetricKind::Trend => Self::Trend(TrendAggregate::new()),
            MetricKind::Rate => Self::Rate(RateAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Trend(_) => MetricKind::Trend,
            Self::Rate(_) => MetricKind::Rate,
        }
    }

    fn consume(&mut self, value: &Value) {
        match (self, value) {
            (Self::Counter(agg), Value::Counter(v)) => agg.consume(v),
            (Self::Trend(agg), Value::Trend(v)) => agg.consume(v),
            (Self::Rate(agg), Value::Rate(v)) => agg.consume(v),
            (values, value) => {
                tracing::warn!(
                    "Ignoring {} sample written to a {} metric",
                    value.kind(),
                    values.kind()
                );
            }
        }
    }

    fn merge(&mut self, other: MetricValues) {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b)) => a.merge(b),
            (Self::Trend(a), Self::Trend(b)) => a.merge(b),
            (Self::Rate(a), Self::Rate(b)) => a.merge(b),
            // shards of one metric always share a kind
            _ => {}
        }
    }
}

/// A named, sharded metric.
pub struct Metric {
    name: String,
    kind: MetricKind,
    shards: Box<[Mutex<MetricValues>]>,
}

impl Metric {
    fn new(name: String, kind: MetricKind, shards: usize) -> Self {
        Self {
            name,
            kind,
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(MetricValues::new(kind)))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Adds one value to the given shard. Each call is atomic with respect to snapshots.
    pub(crate) fn apply(&self, shard: usize, value: &Value) {
        if !value.is_valid() {
            tracing::warn!("Rejecting invalid sample {value:?} for metric {}", self.name);
            return;
        }
        self.shards[shard % self.shards.len()].lock().consume(value);
    }

    fn merged(&self) -> MetricValues {
        let mut merged = MetricValues::new(self.kind);
        for shard in self.shards.iter() {
            let values = shard.lock().clone();
            merged.merge(values);
        }
        merged
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// Run-scoped store of every metric. Created once per run and shared through
/// [`RunContext`](crate::RunContext); there is no process-wide instance.
pub struct Registry {
    metrics: RwLock<HashMap<String, Arc<Metric>>>,
    shards: usize,
    next_shard: AtomicUsize,
    started: Instant,
}

impl Registry {
    /// Registry with the built-in metrics pre-registered and `num_cpus * 4` shards.
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get() * 4)
    }

    pub fn with_shards(shards: usize) -> Self {
        let registry = Self {
            metrics: RwLock::new(HashMap::new()),
            shards: shards.max(1),
            next_shard: AtomicUsize::new(0),
            started: Instant::now(),
        };
        for (name, kind) in builtin::ALL {
            // fresh registry, names are unique
            let _ = registry.metric(name, *kind);
        }
        registry
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Returns the metric called `name`, creating it on first reference.
    pub fn metric(&self, name: &str, kind: MetricKind) -> Result<Arc<Metric>> {
        if let Some(metric) = self.metrics.read().get(name) {
            return check_kind(metric, kind);
        }
        let mut metrics = self.metrics.write();
        let metric = metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Metric::new(name.to_string(), kind, self.shards)));
        check_kind(metric, kind)
    }

    pub fn counter(&self, name: &str) -> Result<Counter> {
        Ok(Counter(self.handle(name, MetricKind::Counter)?))
    }

    pub fn trend(&self, name: &str) -> Result<Trend> {
        Ok(Trend(self.handle(name, MetricKind::Trend)?))
    }

    pub fn rate(&self, name: &str) -> Result<Rate> {
        Ok(Rate(self.handle(name, MetricKind::Rate)?))
    }

    fn handle(&self, name: &str, kind: MetricKind) -> Result<Handle> {
        Ok(Handle {
            metric: self.metric(name, kind)?,
            shard: self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards,
        })
    }

    /// Time since the registry (and therefore the run) was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Freezes the current state of every metric.
    ///
    /// Each shard is locked only while it is cloned, so every `add`/`record` is either
    /// fully in the snapshot or not at all. For a final snapshot call this after all
    /// writers have finished.
    pub fn snapshot(&self) -> RunSnapshot {
        let metrics: Vec<Arc<Metric>> = self.metrics.read().values().cloned().collect();
        RunSnapshot {
            elapsed: self.elapsed(),
            metrics: metrics
                .iter()
                .map(|m| (m.name.clone(), m.merged()))
                .collect(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("metrics", &self.metrics.read().len())
            .field("shards", &self.shards)
            .finish()
    }
}

fn check_kind(metric: &Arc<Metric>, requested: MetricKind) -> Result<Arc<Metric>> {
    if metric.kind != requested {
        return Err(Error::MetricKind {
            name: metric.name.clone(),
            actual: metric.kind,
            requested,
        });
    }
    Ok(Arc::clone(metric))
}

#[derive(Debug, Clone)]
struct Handle {
    metric: Arc<Metric>,
    shard: usize,
}

/// Write handle for a counter metric.
#[derive(Debug, Clone)]
pub struct Counter(Handle);

impl Counter {
    /// Adds `n` to the total. Negative or non-finite values are rejected.
    pub fn add(&self, n: f64) {
        self.0.metric.apply(self.0.shard, &Value::Counter(n));
    }
}

/// Write handle for a trend metric.
#[derive(Debug, Clone)]
pub struct Trend(Handle);

impl Trend {
    pub fn record(&self, value: f64) {
        self.0.metric.apply(self.0.shard, &Value::Trend(value));
    }

    /// Records a duration in milliseconds, the unit of every built-in trend.
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1_000.0);
    }
}

/// Write handle for a rate metric.
#[derive(Debug, Clone)]
pub struct Rate(Handle);

impl Rate {
    pub fn add(&self, value: bool) {
        self.0.metric.apply(self.0.shard, &Value::Rate(value));
    }
}

/// Immutable view of every metric at one point in time.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    elapsed: Duration,
    metrics: BTreeMap<String, MetricValues>,
}

impl RunSnapshot {
    pub fn new(elapsed: Duration, metrics: BTreeMap<String, MetricValues>) -> Self {
        Self { elapsed, metrics }
    }

    /// Run time covered by the snapshot.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn get(&self, name: &str) -> Option<&MetricValues> {
        self.metrics.get(name)
    }

    /// Metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValues)> {
        self.metrics.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Counter total, zero when the metric is missing or not a counter.
    pub fn counter(&self, name: &str) -> f64 {
        match self.metrics.get(name) {
            Some(MetricValues::Counter(c)) => c.total,
            _ => 0.0,
        }
    }

    pub fn trend(&self, name: &str) -> Option<&TrendAggregate> {
        match self.metrics.get(name) {
            Some(MetricValues::Trend(t)) => Some(t),
            _ => None,
        }
    }

    pub fn rate(&self, name: &str) -> Option<&RateAggregate> {
        match self.metrics.get(name) {
            Some(MetricValues::Rate(r)) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn builtins_are_registered_up_front() {
        let registry = Registry::with_shards(2);
        let snapshot = registry.snapshot();

        for (name, kind) in builtin::ALL {
            assert_eq!(snapshot.get(name).map(MetricValues::kind), Some(*kind));
        }
    }

    #[test]
    fn metric_kind_is_fixed_on_first_reference() {
        let registry = Registry::with_shards(2);
        registry.trend("latency").unwrap();

        let err = registry.counter("latency").unwrap_err();
        assert!(matches!(
            err,
            Error::MetricKind {
                actual: MetricKind::Trend,
                requested: MetricKind::Counter,
                ..
            }
        ));
        assert!(registry.rate(builtin::HTTP_REQS).is_err());
    }

    #[test]
    fn invalid_samples_are_rejected() {
        let registry = Registry::with_shards(1);
        let counter = registry.counter("c").unwrap();
        counter.add(2.0);
        counter.add(-1.0);
        counter.add(f64::NAN);

        assert_eq!(registry.snapshot().counter("c"), 2.0);
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let registry = Arc::new(Registry::with_shards(4));
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let counter = registry.counter("hits").unwrap();
                    let trend = registry.trend("latency").unwrap();
                    for i in 0..10_000 {
                        counter.add(1.0);
                        trend.record(i as f64);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter("hits"), 80_000.0);
        assert_eq!(snapshot.trend("latency").unwrap().count(), 80_000);
    }

    #[test]
    fn counters_never_decrease_across_snapshots() {
        let registry = Arc::new(Registry::with_shards(4));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let counter = registry.counter("hits").unwrap();
                    for _ in 0..20_000 {
                        counter.add(1.0);
                    }
                })
            })
            .collect();

        let mut last = 0.0;
        while writers.iter().any(|w| !w.is_finished()) {
            let total = registry.snapshot().counter("hits");
            assert!(total >= last, "counter went from {last} to {total}");
            last = total;
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(registry.snapshot().counter("hits"), 80_000.0);
    }

    #[test]
    fn snapshot_is_frozen() {
        let registry = Registry::with_shards(2);
        let counter = registry.counter("c").unwrap();
        counter.add(1.0);
        let snapshot = registry.snapshot();
        counter.add(1.0);

        assert_eq!(snapshot.counter("c"), 1.0);
        assert_eq!(registry.snapshot().counter("c"), 2.0);
    }

    #[test]
    fn durations_are_recorded_in_milliseconds() {
        let registry = Registry::with_shards(1);
        registry
            .trend("t")
            .unwrap()
            .record_duration(Duration::from_millis(250));

        assert_eq!(registry.snapshot().trend("t").unwrap().max(), Some(250.0));
    }
}
