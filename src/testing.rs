//! In-process fakes shared by the unit tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    error::IterationError,
    executor::ScenarioRun,
    http::{Outcome, Request, Response, Transport},
    metric::Registry,
    runner::RunContext,
    script::{Iteration, IterationResult},
    vu::Vu,
};

/// Answers every request with the same status and body after `latency`.
#[derive(Debug, Clone)]
pub(crate) struct FakeTransport {
    outcome: Outcome,
    body: Bytes,
    latency: Duration,
}

impl FakeTransport {
    pub(crate) fn ok(status: u16, body: &'static str) -> Self {
        Self {
            outcome: Outcome::Status(status),
            body: Bytes::from_static(body.as_bytes()),
            latency: Duration::ZERO,
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, _request: Request) -> Response {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Response {
            outcome: self.outcome.clone(),
            body: self.body.clone(),
            elapsed: self.latency,
        }
    }
}

pub(crate) fn run_context(transport: FakeTransport, seed: Option<u64>) -> Arc<RunContext> {
    Arc::new(RunContext::new(
        Arc::new(Registry::with_shards(4)),
        Arc::new(transport),
        "http://target.test",
        seed,
    ))
}

/// A scenario run that is never stopped early.
pub(crate) fn scenario_run(
    name: &str,
    iteration: impl Iteration + 'static,
    run: &Arc<RunContext>,
) -> ScenarioRun {
    let (_, shutdown) = tokio::sync::watch::channel(false);
    ScenarioRun {
        name: Arc::from(name),
        iteration: Arc::new(iteration),
        run: Arc::clone(run),
        shutdown,
    }
}

/// Returns immediately.
pub(crate) struct Noop;

impl Iteration for Noop {
    fn call<'a>(&'a self, _vu: &'a mut Vu) -> BoxFuture<'a, IterationResult> {
        Box::pin(async { Ok(()) })
    }
}

/// Sleeps for the given duration.
pub(crate) struct Sleep(pub Duration);

impl Iteration for Sleep {
    fn call<'a>(&'a self, vu: &'a mut Vu) -> BoxFuture<'a, IterationResult> {
        Box::pin(async move {
            vu.sleep(self.0).await;
            Ok(())
        })
    }
}

/// Sends one GET to the given path.
pub(crate) struct Hit(pub &'static str);

impl Iteration for Hit {
    fn call<'a>(&'a self, vu: &'a mut Vu) -> BoxFuture<'a, IterationResult> {
        Box::pin(async move {
            vu.get(self.0).await;
            Ok(())
        })
    }
}

pub(crate) struct Fail;

impl Iteration for Fail {
    fn call<'a>(&'a self, _vu: &'a mut Vu) -> BoxFuture<'a, IterationResult> {
        Box::pin(async { IterationResult::Err(IterationError::failed("expected failure")) })
    }
}

pub(crate) struct Panic;

impl Iteration for Panic {
    fn call<'a>(&'a self, _vu: &'a mut Vu) -> BoxFuture<'a, IterationResult> {
        Box::pin(async {
            if true {
                panic!("iteration blew up");
            }
            Ok(())
        })
    }
}
