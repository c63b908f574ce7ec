//! Executors turn a [`Scenario`](crate::Scenario)'s schedule into iterations.
//!
//! Two models are provided:
//! - [`ArrivalRateExecutor`] (open model): iterations start at the scheduled rate no
//!   matter how long earlier ones take. When no VU is free the arrival is dropped.
//! - [`RampingVusExecutor`] (closed model): a varying number of VUs each loop
//!   iterations back to back.
//!
//! Both stop starting iterations when the schedule ends (or a stop is signaled) and
//! then give in-flight iterations `graceful_stop` to finish before aborting them.
pub mod rate;
pub mod vus;

pub use rate::ArrivalRateExecutor;
pub use vus::RampingVusExecutor;

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{Instant, timeout_at},
};

use crate::{
    error::{IterationError, Result},
    runner::RunContext,
    script::Iteration,
    vu::Vu,
};

/// Everything an executor needs to run one scenario.
#[derive(Clone)]
pub struct ScenarioRun {
    pub name: Arc<str>,
    pub iteration: Arc<dyn Iteration>,
    pub run: Arc<RunContext>,
    /// Flips to `true` when the run is stopped early.
    pub shutdown: watch::Receiver<bool>,
}

/// What happened to a scenario's iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub completed: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub peak_vus: usize,
}

/// The runtime hook that executes a scenario.
pub trait Executor
where
    Self: Send + Sync,
{
    fn exec(&self, run: ScenarioRun) -> impl Future<Output = Result<ScenarioOutcome>> + Send;
}

/// Runs one iteration on `vu` and commits its samples.
///
/// Errors and panics are logged and counted in `iteration_errors`; either way the VU
/// stays usable. Returns `false` when the iteration failed.
pub(crate) async fn run_iteration(iteration: &dyn Iteration, vu: &mut Vu) -> bool {
    let started = Instant::now();
    let result = AssertUnwindSafe(iteration.call(&mut *vu))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(IterationError::Panicked(panic_message(panic))));

    let ok = match result {
        Ok(()) => true,
        Err(IterationError::Panicked(message)) => {
            tracing::warn!("VU {} iteration panicked: {message}", vu.id());
            false
        }
        Err(e) => {
            tracing::debug!("VU {} iteration {} failed: {e}", vu.id(), vu.iteration());
            false
        }
    };
    vu.finish_iteration(started.elapsed(), !ok);
    ok
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    }
}

/// Resolves once a stop was signaled. Never resolves if the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Collects finished tasks without waiting.
pub(crate) fn reap(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.try_join_next() {
        if let Err(e) = res {
            tracing::error!("Iteration task failed: {e}");
        }
    }
}

/// Waits up to `graceful_stop` for in-flight tasks, then aborts the rest.
///
/// Returns the number of aborted tasks. Their buffered samples die with them.
pub(crate) async fn drain(tasks: &mut JoinSet<()>, graceful_stop: Duration, name: &str) -> u64 {
    if tasks.is_empty() {
        return 0;
    }
    tracing::info!(
        "Waiting up to {:?} for {} in-flight iterations of {name}...",
        graceful_stop,
        tasks.len()
    );

    let deadline = Instant::now() + graceful_stop;
    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => tracing::error!("Iteration task failed: {e}"),
            Ok(None) => return 0,
            Err(_) => break,
        }
    }

    tracing::warn!(
        "Graceful stop of {name} expired, aborting {} iterations",
        tasks.len()
    );
    tasks.abort_all();
    let mut abandoned = 0;
    while let Some(res) = tasks.join_next().await {
        if matches!(res, Err(ref e) if e.is_cancelled()) {
            abandoned += 1;
        }
    }
    abandoned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metric::builtin,
        testing::{Fail, FakeTransport, Panic, run_context},
    };

    #[tokio::test]
    async fn errors_and_panics_are_counted_and_the_vu_survives() {
        let run = run_context(FakeTransport::ok(200, ""), None);
        let mut vu = Vu::new(1, Arc::from("s"), Arc::clone(&run));

        assert!(!run_iteration(&Fail, &mut vu).await);
        assert!(!run_iteration(&Panic, &mut vu).await);

        let snapshot = run.registry.snapshot();
        assert_eq!(snapshot.counter(builtin::ITERATIONS), 2.0);
        assert_eq!(snapshot.counter(builtin::ITERATION_ERRORS), 2.0);
        assert_eq!(vu.iteration(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_after_graceful_stop() {
        let mut tasks = JoinSet::new();
        tasks.spawn(tokio::time::sleep(Duration::from_secs(1)));
        tasks.spawn(tokio::time::sleep(Duration::from_secs(60)));
        tasks.spawn(tokio::time::sleep(Duration::from_secs(120)));

        let abandoned = drain(&mut tasks, Duration::from_secs(10), "s").await;

        assert_eq!(abandoned, 2);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn stopped_waits_for_the_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        stopped(&mut rx).await;
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(7)), "unknown panic payload");
    }
}
