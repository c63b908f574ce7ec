use thiserror::Error;

use crate::metric::MetricKind;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while configuring or running a load test.
///
/// Everything here is either a configuration problem detected before any traffic is
/// generated, or an I/O problem at the edges (reading configs, writing summaries).
/// Per-request failures are never errors: they are recorded as metrics.
#[derive(Debug, Error)]
pub enum Error {
    /// The run configuration is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A single scenario failed validation.
    #[error("scenario `{scenario}`: {message}")]
    Scenario { scenario: String, message: String },

    /// A scenario references an iteration function that was never registered.
    #[error("unknown iteration function `{0}`")]
    UnknownExec(String),

    /// A threshold targets a metric that no script or config declares.
    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    /// A threshold expression could not be parsed or does not fit its metric.
    #[error("invalid threshold `{expr}`: {reason}")]
    Threshold { expr: String, reason: String },

    /// A metric name is already registered with a different kind.
    #[error("metric `{name}` is a {actual}, not a {requested}")]
    MetricKind {
        name: String,
        actual: MetricKind,
        requested: MetricKind,
    },

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn scenario(scenario: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Scenario {
            scenario: scenario.into(),
            message: message.into(),
        }
    }

    pub fn threshold(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Threshold {
            expr: expr.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of a single iteration.
///
/// Returned by iteration functions; the scheduler logs it, counts it in
/// `iteration_errors` and reuses the virtual user for the next iteration.
#[derive(Debug, Error)]
pub enum IterationError {
    #[error(transparent)]
    Metric(#[from] Error),

    #[error("invalid response body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("iteration panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

impl IterationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
