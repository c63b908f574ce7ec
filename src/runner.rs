use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use tokio::sync::watch;

use crate::{
    config::Plan,
    error::Result,
    executor::{
        ArrivalRateExecutor, Executor, RampingVusExecutor, ScenarioOutcome, ScenarioRun, stopped,
    },
    http::Transport,
    metric::{Registry, RunSnapshot, builtin},
    report::Summary,
    scenario::Scenario,
    script::Iteration,
    threshold::Verdict,
};

/// How often the progress line is logged.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Run-scoped state shared by every VU: the registry, the transport and the target.
pub struct RunContext {
    pub registry: Arc<Registry>,
    pub transport: Arc<dyn Transport>,
    pub base_url: String,
    seed: Option<u64>,
    next_vu: AtomicU64,
    active_vus: AtomicUsize,
}

impl RunContext {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            registry,
            transport,
            base_url: base_url.into(),
            seed,
            next_vu: AtomicU64::new(1),
            active_vus: AtomicUsize::new(0),
        }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Run-wide VU ids, starting at 1.
    pub(crate) fn next_vu_id(&self) -> u64 {
        self.next_vu.fetch_add(1, Ordering::Relaxed)
    }

    /// VUs currently running an iteration, across every scenario.
    pub fn active_vus(&self) -> usize {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub(crate) fn vus_activated(&self, n: usize) {
        self.active_vus.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn vus_released(&self, n: usize) {
        // abandoned counts may race a release, never wrap
        let _ = self
            .active_vus
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("registry", &self.registry)
            .field("base_url", &self.base_url)
            .field("seed", &self.seed)
            .field("active_vus", &self.active_vus())
            .finish()
    }
}

/// Stops a running [`Runner`] early. Iterations already in flight still get their
/// graceful stop.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub snapshot: RunSnapshot,
    pub verdict: Verdict,
    pub summary: Summary,
    pub scenarios: Vec<ScenarioOutcome>,
}

/// Runs every scenario of a [`Plan`] concurrently and judges the result.
pub struct Runner {
    plan: Plan,
    context: Arc<RunContext>,
    stop: Arc<watch::Sender<bool>>,
}

impl Runner {
    pub fn new(plan: Plan, transport: Arc<dyn Transport>) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        for (name, kind) in &plan.metrics {
            registry.metric(name, *kind)?;
        }
        let context = Arc::new(RunContext::new(
            registry,
            transport,
            plan.base_url.clone(),
            plan.seed,
        ));
        let (stop, _) = watch::channel(false);

        Ok(Self {
            plan,
            context,
            stop: Arc::new(stop),
        })
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub async fn run(self) -> Result<RunOutcome> {
        let registry = Arc::clone(&self.context.registry);
        tracing::info!(
            "Starting {} scenarios against {} (planned {:?})...",
            self.plan.scenarios.len(),
            self.context.base_url,
            self.plan.duration()
        );

        let progress = tokio::spawn(progress_task(
            Arc::clone(&self.context),
            self.stop.subscribe(),
        ));

        let runs = self
            .plan
            .scenarios
            .iter()
            .map(|(scenario, iteration)| self.run_scenario(scenario, Arc::clone(iteration)));
        let results = join_all(runs).await;
        progress.abort();

        let scenarios = results.into_iter().collect::<Result<Vec<_>>>()?;
        // every executor drained its tasks, no writer is left
        let snapshot = registry.snapshot();
        let verdict = self.plan.thresholds.evaluate(&snapshot);
        let summary = Summary::new(&snapshot, &verdict, self.plan.duration());
        tracing::info!(
            "Run finished in {:?}, thresholds {}",
            snapshot.elapsed(),
            if verdict.passed { "passed" } else { "failed" }
        );

        Ok(RunOutcome {
            snapshot,
            verdict,
            summary,
            scenarios,
        })
    }

    async fn run_scenario(
        &self,
        scenario: &Scenario,
        iteration: Arc<dyn Iteration>,
    ) -> Result<ScenarioOutcome> {
        let mut shutdown = self.stop.subscribe();
        if !scenario.start_time.is_zero() {
            tracing::info!("Scenario {} starts in {:?}", scenario.name, scenario.start_time);
            tokio::select! {
                _ = tokio::time::sleep(scenario.start_time) => {}
                _ = stopped(&mut shutdown) => {
                    return Ok(ScenarioOutcome {
                        name: scenario.name.clone(),
                        ..Default::default()
                    });
                }
            }
        }

        let run = ScenarioRun {
            name: Arc::from(scenario.name.as_str()),
            iteration,
            run: Arc::clone(&self.context),
            shutdown,
        };
        let outcome = if scenario.executor.is_arrival_rate() {
            ArrivalRateExecutor::from(scenario).exec(run).await?
        } else {
            RampingVusExecutor::from(scenario).exec(run).await?
        };
        tracing::info!(
            "Scenario {}: {} completed, {} dropped, {} abandoned, peak {} VUs",
            outcome.name,
            outcome.completed,
            outcome.dropped,
            outcome.abandoned,
            outcome.peak_vus
        );
        Ok(outcome)
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("plan", &self.plan)
            .field("context", &self.context)
            .finish()
    }
}

/// Logs a progress line every [`PROGRESS_INTERVAL`] until aborted or stopped.
async fn progress_task(run: Arc<RunContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
    // the first tick fires immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }
        let snapshot = run.registry.snapshot();
        tracing::info!(
            "[{:>4.0}s] vus={} iterations={} requests={} failed={} dropped={}",
            snapshot.elapsed().as_secs_f64(),
            run.active_vus(),
            snapshot.counter(builtin::ITERATIONS),
            snapshot.counter(builtin::HTTP_REQS),
            snapshot.rate(builtin::HTTP_REQ_FAILED).map_or(0, |r| r.passes),
            snapshot.counter(builtin::DROPPED_ITERATIONS),
        );
    }
}
