//! Virtual users: the execution context an iteration runs in.
//!
//! A [`Vu`] belongs to one scenario's pool and runs one iteration at a time. Samples an
//! iteration emits are buffered in the VU and only committed to the registry when the
//! iteration completes. An iteration aborted at graceful-stop time therefore leaves no
//! trace in any metric.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tokio::time::Instant;

use crate::{
    error::Result,
    http::{Request, Response},
    metric::{Metric, Sample, Value, builtin},
    runner::RunContext,
};

/// Lifecycle of a virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    /// Parked in the pool, ready to be handed out.
    Idle,
    /// Running iterations.
    Active,
    /// Told to stop; finishing its current iteration.
    Draining,
    /// Removed from the pool for good.
    Stopped,
}

/// A virtual user.
pub struct Vu {
    id: u64,
    scenario: Arc<str>,
    state: VuState,
    iteration: u64,
    shard: usize,
    run: Arc<RunContext>,
    rng: StdRng,
    metrics: HashMap<String, Arc<Metric>>,
    pending: Vec<(Arc<Metric>, Sample)>,
}

impl Vu {
    pub(crate) fn new(id: u64, scenario: Arc<str>, run: Arc<RunContext>) -> Self {
        let rng = match run.seed() {
            // distinct, reproducible stream per VU
            Some(seed) => StdRng::seed_from_u64(seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        };
        let shard = (id as usize) % run.registry.shards();
        Self {
            id,
            scenario,
            state: VuState::Idle,
            iteration: 0,
            shard,
            run,
            rng,
            metrics: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Run-wide unique id, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: VuState) {
        self.state = state;
    }

    /// Zero-based number of the iteration currently running on this VU.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Joins `path` onto the run's base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.run.base_url.trim_end_matches('/'), path)
    }

    /// The VU's value generator. Deterministic when the run has a seed.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Picks a random element of `items`.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.rng)
    }

    /// Suspends the iteration, e.g. to model think time.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Sends `request` and records `http_reqs`, `http_req_duration` and
    /// `http_req_failed` for it.
    pub async fn request(&mut self, request: Request) -> Response {
        let response = self.run.transport.send(request).await;
        self.push_builtin(builtin::HTTP_REQS, Value::Counter(1.0));
        self.push_builtin(
            builtin::HTTP_REQ_DURATION,
            Value::Trend(response.duration_ms()),
        );
        self.push_builtin(builtin::HTTP_REQ_FAILED, Value::Rate(response.failed()));
        response
    }

    pub async fn get(&mut self, path: &str) -> Response {
        let url = self.url(path);
        self.request(Request::get(url)).await
    }

    pub async fn post_json(&mut self, path: &str, body: impl Into<Bytes>) -> Response {
        let url = self.url(path);
        self.request(Request::post(url).json(body)).await
    }

    /// Records a named check into `checks` and returns `ok`.
    pub fn check(&mut self, name: &str, ok: bool) -> bool {
        if !ok {
            tracing::debug!("VU {} of {} check failed: {name}", self.id, self.scenario);
        }
        self.push_builtin(builtin::CHECKS, Value::Rate(ok));
        ok
    }

    /// Adds `n` to the counter `name`.
    pub fn add(&mut self, name: &str, n: f64) -> Result<()> {
        self.push(name, Value::Counter(n))
    }

    /// Records `value` into the trend `name`.
    pub fn record(&mut self, name: &str, value: f64) -> Result<()> {
        self.push(name, Value::Trend(value))
    }

    /// Records a boolean into the rate `name`.
    pub fn rate(&mut self, name: &str, value: bool) -> Result<()> {
        self.push(name, Value::Rate(value))
    }

    fn push(&mut self, name: &str, value: Value) -> Result<()> {
        let metric = match self.metrics.get(name) {
            Some(metric) if metric.kind() == value.kind() => Arc::clone(metric),
            _ => {
                let metric = self.run.registry.metric(name, value.kind())?;
                self.metrics.insert(name.to_string(), Arc::clone(&metric));
                metric
            }
        };
        self.pending.push((metric, Sample::now(value)));
        Ok(())
    }

    fn push_builtin(&mut self, name: &str, value: Value) {
        if let Err(e) = self.push(name, value) {
            tracing::warn!("VU {} could not record {name}: {e}", self.id);
        }
    }

    /// Starts timing a named group of steps. Hand the group back to
    /// [`Vu::end_group`] once its steps are done.
    pub fn group(&self, name: &str) -> Group {
        Group {
            name: name.to_string(),
            started: Instant::now(),
        }
    }

    /// Records the group's duration into `group_duration` and into its
    /// `group_duration{group:::<name>}` submetric.
    pub fn end_group(&mut self, group: Group) -> Duration {
        let elapsed = group.started.elapsed();
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.push_builtin(builtin::GROUP_DURATION, Value::Trend(ms));
        self.push_builtin(&builtin::group_duration(&group.name), Value::Trend(ms));
        elapsed
    }

    /// Number of samples waiting for the current iteration to complete.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Closes the current iteration: records its own metrics and commits every
    /// buffered sample to the registry.
    pub(crate) fn finish_iteration(&mut self, elapsed: Duration, errored: bool) {
        self.push_builtin(builtin::ITERATIONS, Value::Counter(1.0));
        self.push_builtin(
            builtin::ITERATION_DURATION,
            Value::Trend(elapsed.as_secs_f64() * 1_000.0),
        );
        if errored {
            self.push_builtin(builtin::ITERATION_ERRORS, Value::Counter(1.0));
        }
        if let (Some((_, first)), Some((_, last))) = (self.pending.first(), self.pending.last()) {
            tracing::trace!(
                "VU {} committing {} samples emitted over {:?}",
                self.id,
                self.pending.len(),
                last.at.duration_since(first.at)
            );
        }
        for (metric, sample) in self.pending.drain(..) {
            metric.apply(self.shard, &sample.value);
        }
        self.iteration += 1;
    }

    /// Throws away everything the current iteration recorded.
    pub(crate) fn discard(&mut self) {
        self.pending.clear();
    }
}

/// A running group of steps, see [`Vu::group`].
#[derive(Debug)]
#[must_use = "a group records nothing until passed to `Vu::end_group`"]
pub struct Group {
    name: String,
    started: Instant,
}

impl fmt::Debug for Vu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vu")
            .field("id", &self.id)
            .field("scenario", &self.scenario)
            .field("state", &self.state)
            .field("iteration", &self.iteration)
            .field("pending", &self.pending.len())
            .finish()
    }
}
