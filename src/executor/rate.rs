//! The `ArrivalRateExecutor`: the open model behind `ramping-arrival-rate` and
//! `constant-arrival-rate`.
//!
//! A single governor loop ticks every `tick`. On each tick it computes how many
//! iterations should start during the coming interval, takes that many VUs from the
//! scenario's [`VuPool`] and spawns one task per iteration. Arrivals never wait for
//! completions: if the pool is exhausted the arrival is dropped and counted in
//! `dropped_iterations`. It is never queued or retried.
//!
//! # Arrival math
//! With `r(t)` the schedule value (iterations per `time_unit`), the arrivals for the
//! tick `[t0, t1)` are the exact integral of the piecewise-linear curve:
//!
//! ```text
//! add_f = ∫ r(t) dt over [t0, t1] / time_unit
//! add_total = floor(add_f + fractional)
//! fractional = (add_f + fractional) - add_total
//! ```
//!
//! Because the integral is exact, stage boundaries falling inside a tick and stages
//! shorter than a second are honored, and the fractional carry keeps the long-term
//! count equal to the area under the curve.
//!
//! # Tuning knobs
//! - `tick`: smaller ticks spread arrivals more evenly at the cost of more wakeups.
//!   Default 10ms.
//! - `pre_allocated_vus` / `max_vus`: VUs created up front and the hard cap on
//!   concurrently running iterations.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
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
};
use internals::*;

/// Per-tick arrivals above this are capped so a runaway rate cannot spin the governor.
const MAX_ARRIVALS: u64 = u32::MAX as u64;

/// Absorbs floating point error so an exact integer of arrivals is not lost to
/// `4.999999999`.
const EPSILON: f64 = 1e-9;

/// Open-model executor driven by a [`Schedule`] of arrival rates.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ArrivalRateExecutor {
    /// Iterations per `time_unit`, over time.
    pub schedule: Schedule,
    #[builder(default = Duration::from_secs(1))]
    pub time_unit: Duration,
    /// The granularity of the governor's dispatch tick.
    #[builder(default = DEFAULT_TICK)]
    pub tick: Duration,
    #[builder(default = 1)]
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
    #[builder(default = DEFAULT_GRACEFUL_STOP)]
    pub graceful_stop: Duration,
}

impl From<&Scenario> for ArrivalRateExecutor {
    fn from(scenario: &Scenario) -> Self {
        Self::builder()
            .schedule(scenario.schedule.clone())
            .time_unit(scenario.time_unit)
            .tick(scenario.tick)
            .pre_allocated_vus(scenario.pre_allocated_vus)
            .max_vus(scenario.max_vus)
            .graceful_stop(scenario.graceful_stop)
            .build()
    }
}

impl Executor for ArrivalRateExecutor {
    async fn exec(&self, scenario: ScenarioRun) -> Result<ScenarioOutcome> {
        let ScenarioRun {
            name,
            iteration,
            run,
            mut shutdown,
        } = scenario;
        let dropped_metric = run.registry.counter(builtin::DROPPED_ITERATIONS)?;
        let abandoned_metric = run.registry.counter(builtin::ABANDONED_ITERATIONS)?;

        tracing::info!(
            "Pre-allocating {} VUs (max {}) for scenario {name}...",
            self.pre_allocated_vus,
            self.max_vus
        );
        let pool = Arc::new(VuPool::new(
            Arc::clone(&name),
            Arc::clone(&run),
            self.pre_allocated_vus,
            self.max_vus,
        ));
        let completed = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();
        let mut dropped = 0;

        let total = self.schedule.total_duration();
        let stages = self.schedule.stages().len();
        let mut stage = None;
        let mut fractional = 0.0;
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

            let next = (elapsed + self.tick).min(total);
            let (arrivals, f) =
                calc_arrivals(&self.schedule, elapsed, next, self.time_unit, fractional);
            fractional = f;

            for started in 0..arrivals {
                let mut vu = match pool.acquire() {
                    Ok(vu) => vu,
                    Err(e) => {
                        let missed = arrivals - started;
                        tracing::debug!("Dropping {missed} iterations of {name}: {e}");
                        dropped_metric.add(missed as f64);
                        dropped += missed;
                        break;
                    }
                };
                let pool = Arc::clone(&pool);
                let iteration = Arc::clone(&iteration);
                let completed = Arc::clone(&completed);
                tasks.spawn(async move {
                    run_iteration(iteration.as_ref(), &mut vu).await;
                    completed.fetch_add(1, Ordering::Relaxed);
                    pool.release(vu);
                });
            }
            reap(&mut tasks);

            elapsed = next;
            tokio::select! {
                _ = tokio::time::sleep_until(start + elapsed) => {}
                _ = stopped(&mut shutdown) => {
                    tracing::info!("Scenario {name} received stop signal.");
                    break;
                }
            }
        }

        tracing::info!("Scenario {name} finished dispatching, draining...");
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
            dropped,
            abandoned,
            peak_vus: pool.peak_active(),
        })
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Arrival calculation, exposed through the `internals` feature.
mod internals {
    use super::*;

    /// Pure function computing how many iterations start during `[from, to]`.
    ///
    /// Carries any fractional arrival over to the next tick to keep the long-term
    /// count exact.
    ///
    /// Returns `(arrivals, next_fractional_part)`.
    pub fn calc_arrivals(
        schedule: &Schedule,
        from: Duration,
        to: Duration,
        time_unit: Duration,
        fractional: f64,
    ) -> (u64, f64) {
        let add_f = schedule.integral(from, to) / time_unit.as_secs_f64();
        let acc = add_f + fractional;
        if !acc.is_finite() || acc >= MAX_ARRIVALS as f64 {
            return (MAX_ARRIVALS, 0.0);
        }
        if acc <= 0.0 {
            return (0, 0.0);
        }

        let add_total = (acc + EPSILON).floor();
        let fractional = (acc - add_total).max(0.0);
        (add_total as u64, fractional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scenario::Stage,
        testing::{FakeTransport, Hit, Noop, Sleep, run_context, scenario_run},
    };

    const TICK: Duration = Duration::from_millis(100);

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    mod calc_arrivals {
        use super::*;

        #[test]
        fn linearity() {
            let mut rate = 100.;
            let mut expected = 10;
            for _ in 0..8 {
                let schedule = Schedule::constant(rate, secs(10));
                let (n, f) = calc_arrivals(&schedule, secs(1), secs(1) + TICK, secs(1), 0.);

                assert_eq!(n, expected);
                assert!(f < 1e-6);

                rate *= 10.;
                expected *= 10;
            }
        }

        #[test]
        fn fractional_accumulation() {
            let schedule = Schedule::constant(12.5, secs(10));
            let mut facc = 0.;
            let mut total = 0;
            let expected_fs = [0.25, 0.5, 0.75, 0.];

            for i in 0..8u64 {
                let from = TICK * i as u32;
                let (n, f) = calc_arrivals(&schedule, from, from + TICK, secs(1), facc);
                facc = f;
                total += n;

                let expected_f = expected_fs[i as usize % 4];
                let expected_n = if expected_f == 0. { 2 } else { 1 };
                assert_eq!(n, expected_n);
                assert!((f - expected_f).abs() < 1e-9);
            }
            assert_eq!(total, 10);
        }

        #[test]
        fn ramp_down() {
            let schedule = Schedule::new(100., vec![Stage::new(secs(10), 0.)]);

            let mut total = 0;
            let mut facc = 0.;
            for i in 0..100u32 {
                let (n, f) = calc_arrivals(&schedule, TICK * i, TICK * (i + 1), secs(1), facc);
                facc = f;
                total += n;
            }
            assert_eq!(total, 500);
        }

        #[test]
        fn hold_steady() {
            let schedule = Schedule::constant(100., secs(10));

            for i in 0..10 {
                let (n, f) = calc_arrivals(&schedule, secs(i), secs(i) + TICK, secs(1), 0.);
                assert_eq!(n, 10);
                assert!(f < 1e-6);
            }
        }

        #[test]
        fn ramp_up_integrates_each_tick() {
            let schedule = Schedule::new(0., vec![Stage::new(secs(10), 100.)]);

            // over [1s, 2s] the rate climbs from 10/s to 20/s
            let (n, f) = calc_arrivals(&schedule, secs(1), secs(2), secs(1), 0.);
            assert_eq!(n, 15);
            assert!(f < 1e-6);
        }

        #[test]
        fn time_unit_scales_the_rate() {
            let schedule = Schedule::constant(60., secs(120));

            let (n, _) = calc_arrivals(&schedule, secs(0), secs(1), Duration::from_secs(60), 0.);
            assert_eq!(n, 1);
        }

        #[test]
        fn nothing_arrives_after_the_schedule() {
            let schedule = Schedule::new(0., vec![Stage::new(secs(10), 100.)]);

            for i in 10..20 {
                let (n, f) = calc_arrivals(&schedule, secs(i), secs(i) + TICK, secs(1), 0.);
                assert_eq!(n, 0);
                assert_eq!(f, 0.);
            }
        }

        #[test]
        fn negative_value_returns_0() {
            let schedule = Schedule::constant(-100., secs(10));
            let (n, f) = calc_arrivals(&schedule, secs(1), secs(1) + TICK, secs(1), 0.);

            assert_eq!(n, 0);
            assert_eq!(f, 0.0);
        }

        #[test]
        fn extreme_rate_cap_at_max_arrivals() {
            let schedule = Schedule::constant(f64::MAX, secs(1));
            let (n, f) = calc_arrivals(&schedule, secs(0), secs(1), secs(1), 0.);

            assert_eq!(n, MAX_ARRIVALS);
            assert_eq!(f, 0.);
        }
    }

    fn executor(schedule: Schedule, pre: usize, max: usize) -> ArrivalRateExecutor {
        ArrivalRateExecutor::builder()
            .schedule(schedule)
            .pre_allocated_vus(pre)
            .max_vus(max)
            .graceful_stop(secs(30))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn constant_rate_matches_rate_times_duration() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(Schedule::constant(10., secs(5)), 5, 20);

        let outcome = exec.exec(scenario_run("constant", Noop, &run)).await.unwrap();

        assert!((49..=51).contains(&outcome.completed), "{outcome:?}");
        assert_eq!(outcome.dropped, 0);
        assert_eq!(run.registry.snapshot().counter(builtin::ITERATIONS), outcome.completed as f64);
    }

    #[tokio::test(start_paused = true)]
    async fn linear_ramp_starts_the_area_under_the_curve() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(
            Schedule::new(0., vec![Stage::new(secs(10), 100.)]),
            10,
            50,
        );

        let outcome = exec.exec(scenario_run("ramp", Noop, &run)).await.unwrap();

        assert!((495..=505).contains(&outcome.completed), "{outcome:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_drops_arrivals() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(Schedule::constant(10., secs(5)), 1, 1);

        let outcome = exec
            .exec(scenario_run("slow", Sleep(secs(1)), &run))
            .await
            .unwrap();

        assert!((40..=46).contains(&outcome.dropped), "{outcome:?}");
        assert_eq!(outcome.completed + outcome.dropped, 50);
        assert_eq!(outcome.peak_vus, 1);
        let snapshot = run.registry.snapshot();
        assert_eq!(snapshot.counter(builtin::DROPPED_ITERATIONS), outcome.dropped as f64);
        // drops are not request failures
        assert_eq!(snapshot.rate(builtin::HTTP_REQ_FAILED).unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spike_never_exceeds_max_vus() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(
            Schedule::new(
                10.,
                vec![
                    Stage::new(secs(2), 10.),
                    Stage::new(Duration::ZERO, 1_000.),
                    Stage::new(secs(2), 1_000.),
                ],
            ),
            2,
            25,
        );

        let outcome = exec
            .exec(scenario_run("spike", Sleep(Duration::from_millis(500)), &run))
            .await
            .unwrap();

        assert_eq!(outcome.peak_vus, 25);
        assert!(outcome.dropped > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_abandons_in_flight_iterations() {
        let run = run_context(
            FakeTransport::ok(200, "").with_latency(secs(120)),
            None,
        );
        let exec = ArrivalRateExecutor::builder()
            .schedule(Schedule::constant(2., secs(2)))
            .pre_allocated_vus(10)
            .max_vus(10)
            .graceful_stop(secs(5))
            .build();

        let outcome = exec
            .exec(scenario_run("stuck", Hit("/slow"), &run))
            .await
            .unwrap();

        assert_eq!(outcome.completed, 0);
        assert_eq!(outcome.abandoned, 4);
        let snapshot = run.registry.snapshot();
        assert_eq!(snapshot.counter(builtin::ABANDONED_ITERATIONS), 4.0);
        assert_eq!(snapshot.counter(builtin::HTTP_REQS), 0.0);
        assert!(snapshot.trend(builtin::HTTP_REQ_DURATION).unwrap().is_empty());
        assert_eq!(snapshot.counter(builtin::ITERATIONS), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_ends_dispatch_early() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let exec = executor(Schedule::constant(10., secs(60)), 5, 5);
        let (tx, rx) = tokio::sync::watch::channel(false);
        let mut scenario = scenario_run("stopped", Noop, &run);
        scenario.shutdown = rx;

        let handle = tokio::spawn(async move { exec.exec(scenario).await });
        tokio::time::sleep(secs(2)).await;
        tx.send_replace(true);
        let outcome = handle.await.unwrap().unwrap();

        assert!(outcome.completed <= 25, "{outcome:?}");
    }
}
