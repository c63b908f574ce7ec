//! Iteration functions and the registry scenarios resolve them from.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use futures::future::BoxFuture;

use crate::{
    error::{Error, IterationError, Result},
    metric::MetricKind,
    vu::Vu,
};

pub type IterationResult = std::result::Result<(), IterationError>;

/// One user-scripted iteration.
///
/// Implemented for every `Fn(&mut Vu) -> BoxFuture<'_, IterationResult>`, which is
/// exactly what [`#[iteration]`](crate::iteration) produces from an `async fn`.
///
/// # Example
/// ```rust
/// use volley::{iteration, IterationResult, Scripts, Vu};
///
/// #[iteration]
/// async fn ping(vu: &mut Vu) -> IterationResult {
///     let res = vu.get("/ping").await;
///     vu.check("status is 200", res.status() == Some(200));
///     Ok(())
/// }
///
/// let mut scripts = Scripts::new();
/// scripts.register("ping", ping);
/// assert!(scripts.resolve("ping").is_ok());
/// ```
pub trait Iteration
where
    Self: Send + Sync,
{
    fn call<'a>(&'a self, vu: &'a mut Vu) -> BoxFuture<'a, IterationResult>;
}

impl<F> Iteration for F
where
    F: for<'a> Fn(&'a mut Vu) -> BoxFuture<'a, IterationResult> + Send + Sync,
{
    fn call<'a>(&'a self, vu: &'a mut Vu) -> BoxFuture<'a, IterationResult> {
        self(vu)
    }
}

/// Named iteration functions plus the custom metrics they write.
///
/// Scenarios reference functions by name through `exec`; resolution happens while the
/// configuration is loaded, so a typo fails before any traffic is sent.
#[derive(Clone, Default)]
pub struct Scripts {
    iterations: HashMap<String, Arc<dyn Iteration>>,
    metrics: BTreeMap<String, MetricKind>,
}

impl Scripts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `iteration` under `name`, replacing any previous registration.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        iteration: impl Iteration + 'static,
    ) -> &mut Self {
        self.iterations.insert(name.into(), Arc::new(iteration));
        self
    }

    /// Declares a custom metric so thresholds may reference it before it is written.
    pub fn declare_metric(&mut self, name: impl Into<String>, kind: MetricKind) -> &mut Self {
        self.metrics.insert(name.into(), kind);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Iteration>> {
        self.iterations
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownExec(name.to_string()))
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.iterations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn declared_metrics(&self) -> &BTreeMap<String, MetricKind> {
        &self.metrics
    }
}

impl fmt::Debug for Scripts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scripts")
            .field("iterations", &self.names())
            .field("metrics", &self.metrics)
            .finish()
    }
}
