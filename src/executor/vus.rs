//! The `RampingVusExecutor`: the closed model behind `ramping-vus` and
//! `constant-vus`.
//!
//! Every tick the executor computes the target VU count `floor(v(t))`, capped at
//! `max_vus`, and reconciles the running workers toward it. Missing workers are
//! started with a VU from the pool. Excess workers get their stop flag raised and leave
//! after the iteration they are running, handing their VU back to a pool that shrinks
//! toward `pre_allocated_vus`.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{task::JoinSet, time::Instant};
use typed_builder::TypedBuilder;

use super::{Executor, ScenarioOutcome, ScenarioRun, drain, reap, run_iteration, stopped};
use crate::{
    error::Result,
    metric::builtin,
    pool::VuPool,
    scenario::{DEFAULT_GRACEFUL_STOP, DEFAULT_TICK, Scenario, Schedule},
    vu::VuState,
};

/// Closed-model executor driven by a [`Schedule`] of VU counts.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RampingVusExecutor {
    pub schedule: Schedule,
    #[builder(default = DEFAULT_TICK)]
    pub tick: Duration,
    /// VUs kept allocated while the target ramps down.
    #[builder(default = 0)]
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
    #[builder(default = DEFAULT_GRACEFUL_STOP)]
    pub graceful_stop: Duration,
}

impl From<&Scenario> for RampingVusExecutor {
    fn from(scenario: &Scenario) -> Self {
        Self::builder()
            .schedule(scenario.schedule.clone())
            .tick(scenario.tick)
            .pre_allocated_vus(scenario.pre_allocated_vus)
            .max_vus(scenario.max_vus)
            .graceful_stop(scenario.graceful_stop)
            .build()
    }
}

impl RampingVusExecutor {
    /// Number of VUs that should be looping at `t`.
    pub fn target_at(&self, t: Duration) -> usize {
        let value = self.schedule.value_at(t);
        if !value.is_finite() || value <= 0.0 {
            return 0;
        }
        (value.floor() as usize).min(self.max_vus)
    }
}

impl Executor for RampingVusExecutor {
    async fn exec(&self, scenario: ScenarioRun) -> Result<ScenarioOutcome> {
        let ScenarioRun {
            name,
            iteration,
            run,
            mut shutdown,
        } = scenario;
        let abandoned_metric = run.registry.counter(builtin::ABANDONED_ITERATIONS)?;

        let pool = Arc::new(VuPool::new(
            Arc::clone(&name),
            Arc::clone(&run),
            self.pre_allocated_vus,
            self.max_vus,
        ));
        let completed = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();
        // stop flags of the running workers, oldest first
        let mut workers: Vec<Arc<AtomicBool>> = Vec::new();

        let total = self.schedule.total_duration();
        let stages = self.schedule.stages().len();
        let mut stage = None;
        let mut elapsed = Duration::ZERO;
        let start = Instant::now();

        tracing::info!("Running scenario: {name}!");
        while elapsed < total {
            let current = self.schedule.stage_index_at(elapsed);
            if current != stage {
                if let Some(i) = current {
                    tracing::info!("Starting stage: {}/{stages} of {name}", i + 1);
                }
                stage = current;
            }

            let target = self.target_at(elapsed);
            if workers.len() != target {
                tracing::debug!("Scenario {name}: {} -> {target} VUs", workers.len());
            }
            while workers.len() < target {
                let mut vu = match pool.acquire() {
                    Ok(vu) => vu,
                    Err(e) => {
                        // stopped workers still finishing their iteration hold VUs
                        tracing::debug!("Cannot start a VU for {name} yet: {e}");
                        break;
                    }
                };
                let stop = Arc::new(AtomicBool::new(false));
                workers.push(Arc::clone(&stop));

                let pool = Arc::clone(&pool);
                let iteration = Arc::clone(&iteration);
                let completed = Arc::clone(&completed);
                tasks.spawn(async move {
                    tracing::debug!("VU {} started.", vu.id());
                    while !stop.load(Ordering::Acquire) {
                        run_iteration(iteration.as_ref(), &mut vu).await;
                        completed.fetch_add(1, Ordering::Relaxed);
                        // iterations that never suspend must not starve the scheduler
                        tokio::task::yield_now().await;
                    }
                    vu.set_state(VuState::Draining);
                    tracing::debug!("VU {} shutting down.", vu.id());
                    pool.release(vu);
                });
            }
            while workers.len() > target {
                if let Some(stop) = workers.pop() {
                    stop.store(true, Ordering::Release);
                    pool.shrink(1);
                }
            }
            reap(&mut tasks);

            elapsed = (elapsed + self.tick).min(total);
            tokio::select! {
                _ = tokio::time::sleep_until(start + elapsed) => {}
                _ = stopped(&mut shutdown) => {
                    tracing::info!("Scenario {name} received stop signal.");
                    break;
                }
            }
        }

        tracing::info!("Scenario {name} finished, stopping {} VUs...", workers.len());
        for stop in workers.drain(..) {
            stop.store(true, Ordering::Release);
        }
        let abandoned = drain(&mut tasks, self.graceful_stop, &name).await;
        if abandoned > 0 {
            pool.abandoned(abandoned as usize);
            abandoned_metric.add(abandoned as f64);
        }
        pool.close();

        tracing::info!("Done running scenario: {name}!");
        Ok(ScenarioOutcome {
            name: name.to_string(),
            completed: completed.load(Ordering::Relaxed),
            dropped: 0,
            abandoned,
            peak_vus: pool.peak_active(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scenario::Stage,
        testing::{FakeTransport, Hit, Sleep, run_context, scenario_run},
    };

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn executor(schedule: Schedule, max: usize) -> RampingVusExecutor {
        RampingVusExecutor::builder()
            .schedule(schedule)
            .max_vus(max)
            .build()
    }

    #[test]
    fn target_is_floored_and_capped() {
        let exec = executor(Schedule::new(0., vec![Stage::new(secs(10), 20.)]), 15);

        assert_eq!(exec.target_at(secs(0)), 0);
        assert_eq!(exec.target_at(Duration::from_millis(4_900)), 9);
        assert_eq!(exec.target_at(secs(5)), 10);
        assert_eq!(exec.target_at(secs(9)), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn constant_vus_loop_iterations_back_to_back() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(Schedule::constant(4., secs(10)), 4);

        let outcome = exec
            .exec(scenario_run("loop", Sleep(secs(1)), &run))
            .await
            .unwrap();

        // 4 VUs x 10 one-second iterations, plus at most one more each if a VU
        // wins the race against the stop flag at the 10s mark
        assert!((40..=44).contains(&outcome.completed), "{outcome:?}");
        assert_eq!(outcome.peak_vus, 4);
        assert_eq!(outcome.abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_never_exceeds_max_vus() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(
            Schedule::new(
                0.,
                vec![
                    Stage::new(secs(2), 50.),
                    Stage::new(secs(2), 0.),
                    Stage::new(secs(2), 50.),
                ],
            ),
            8,
        );

        let outcome = exec
            .exec(scenario_run("ramp", Sleep(Duration::from_millis(300)), &run))
            .await
            .unwrap();

        assert_eq!(outcome.peak_vus, 8);
        assert!(outcome.completed > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_down_lets_iterations_finish() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(
            Schedule::new(
                3.,
                vec![
                    Stage::new(secs(2), 3.),
                    Stage::new(Duration::ZERO, 1.),
                    Stage::new(secs(2), 1.),
                ],
            ),
            3,
        );

        let outcome = exec
            .exec(scenario_run("down", Sleep(Duration::from_millis(1_500)), &run))
            .await
            .unwrap();

        // stopped VUs finish their iteration, nothing is abandoned
        assert_eq!(outcome.abandoned, 0);
        assert_eq!(run.registry.snapshot().counter(builtin::ITERATIONS), outcome.completed as f64);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_abandons_stuck_vus() {
        let run = run_context(FakeTransport::ok(200, "").with_latency(secs(300)), None);
        let exec = RampingVusExecutor::builder()
            .schedule(Schedule::constant(2., secs(3)))
            .max_vus(2)
            .graceful_stop(secs(10))
            .build();

        let outcome = exec.exec(scenario_run("stuck", Hit("/"), &run)).await.unwrap();

        assert_eq!(outcome.abandoned, 2);
        assert_eq!(outcome.completed, 0);
        assert_eq!(run.registry.snapshot().counter(builtin::HTTP_REQS), 0.0);
    }
}
