//! Volley: a scenario-driven HTTP load generator.
//!
//! A run is described by a set of named scenarios. Each scenario drives a single
//! iteration function with one of four executors, and the whole run is judged
//! against pass/fail thresholds once it finishes.
//!
//! # Architecture
//!
//! - [`Scenario`]: a validated executor configuration plus the piecewise-linear
//!   schedule it follows.
//! - [`Executor`]: runs a scenario. The open model (arrival rate) starts iterations on
//!   a clock and drops them when the VU pool is exhausted; the closed model (VUs) keeps
//!   a target number of looping workers alive.
//! - [`Vu`]: the per-iteration context scripts talk to. It owns the VU's RNG and
//!   buffers its samples until the iteration finishes.
//! - [`Registry`]: sharded metric storage. Counters, trends and rates merge into a
//!   [`RunSnapshot`] at the end of the run.
//! - [`Thresholds`](threshold::Thresholds) and [`Summary`]: the verdict and the report
//!   built from a snapshot. [`Reporter`]s send the summary somewhere.
//! - [`Runner`]: glues a [`Plan`](config::Plan) together and runs every scenario
//!   concurrently.
//!
//! # Writing iterations
//!
//! ```rust
//! use volley::{iteration, IterationResult, Vu};
//!
//! #[iteration]
//! async fn browse(vu: &mut Vu) -> IterationResult {
//!     let res = vu.get("/api/products").await;
//!     vu.check("status 200", res.status() == Some(200));
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//! - `internals`: exposes the arrival calculation used by the arrival-rate executor.

extern crate self as volley;

/// Metric aggregators
pub mod aggregate;
/// YAML/JSON run configuration and the validated plan
pub mod config;
pub mod error;
/// Scenario executors for the open and closed models
pub mod executor;
/// HTTP transport
pub mod http;
/// Metric kinds, samples and the sharded registry
pub mod metric;
/// Bounded pool of virtual users
pub mod pool;
/// Summaries and reporters
pub mod report;
/// Orchestrates a whole run
pub mod runner;
/// Scenario configuration and schedules
pub mod scenario;
pub mod script;
/// Built-in iteration functions
pub mod scripts;
/// Threshold expressions and the run verdict
pub mod threshold;
pub mod vu;

#[cfg(test)]
mod testing;

pub use futures::future::BoxFuture;
pub use volley_macros::iteration;

pub use aggregate::Aggregate;
pub use error::{Error, IterationError, Result};
pub use executor::Executor;
pub use http::{HttpTransport, Request, Response, Transport};
pub use metric::{MetricKind, Registry, RunSnapshot};
pub use report::{JsonReporter, Reporter, StdoutReporter, Summary};
pub use runner::{RunContext, RunOutcome, Runner, StopHandle};
pub use scenario::Scenario;
pub use script::{Iteration, IterationResult, Scripts};
pub use vu::Vu;
