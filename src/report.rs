use std::{collections::BTreeMap, fmt, future::Future, path::PathBuf, time::Duration};

use serde::Serialize;

use crate::{
    aggregate::TrendAggregate,
    error::Result,
    metric::{MetricValues, RunSnapshot, builtin},
    threshold::{ThresholdResult, Verdict},
};

/// Final, structured result of a run.
///
/// A `Summary` is the processed form of a [`RunSnapshot`] plus the threshold
/// [`Verdict`]. It is pure data, built without I/O, and identical snapshots always
/// produce identical summaries. Presentation and export are left to a [`Reporter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub passed: bool,
    /// Planned duration of the longest scenario, including its start offset.
    pub duration_secs: f64,
    pub elapsed_secs: f64,
    pub requests: RequestSummary,
    pub iterations: IterationSummary,
    pub trends: BTreeMap<String, TrendSummary>,
    pub counters: BTreeMap<String, CounterSummary>,
    pub rates: BTreeMap<String, RateSummary>,
    pub thresholds: Vec<ThresholdResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    pub total: u64,
    /// Requests per second of elapsed run time.
    pub rate: f64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationSummary {
    pub completed: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub count: u64,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub med: Option<f64>,
    pub max: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl From<&TrendAggregate> for TrendSummary {
    fn from(t: &TrendAggregate) -> Self {
        Self {
            count: t.count(),
            avg: t.avg(),
            min: t.min(),
            med: t.median(),
            max: t.max(),
            p90: t.percentile(90.0),
            p95: t.percentile(95.0),
            p99: t.percentile(99.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSummary {
    pub total: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSummary {
    pub passes: u64,
    pub fails: u64,
    pub rate: Option<f64>,
}

impl Summary {
    pub fn new(snapshot: &RunSnapshot, verdict: &Verdict, duration: Duration) -> Self {
        let elapsed = snapshot.elapsed().as_secs_f64();
        let per_sec = |total: f64| if elapsed > 0.0 { total / elapsed } else { 0.0 };

        let mut trends = BTreeMap::new();
        let mut counters = BTreeMap::new();
        let mut rates = BTreeMap::new();
        for (name, values) in snapshot.iter() {
            match values {
                MetricValues::Trend(t) => {
                    trends.insert(name.to_string(), TrendSummary::from(t));
                }
                MetricValues::Counter(c) => {
                    counters.insert(
                        name.to_string(),
                        CounterSummary {
                            total: c.total,
                            rate: per_sec(c.total),
                        },
                    );
                }
                MetricValues::Rate(r) => {
                    rates.insert(
                        name.to_string(),
                        RateSummary {
                            passes: r.passes,
                            fails: r.fails,
                            rate: r.rate(),
                        },
                    );
                }
            }
        }

        let count = |name: &str| snapshot.counter(name) as u64;
        let requests = snapshot.counter(builtin::HTTP_REQS);
        Self {
            passed: verdict.passed,
            duration_secs: duration.as_secs_f64(),
            elapsed_secs: elapsed,
            requests: RequestSummary {
                total: requests as u64,
                rate: per_sec(requests),
                // a "true" http_req_failed sample is a failed request
                failed: snapshot
                    .rate(builtin::HTTP_REQ_FAILED)
                    .map_or(0, |r| r.passes),
            },
            iterations: IterationSummary {
                completed: count(builtin::ITERATIONS),
                dropped: count(builtin::DROPPED_ITERATIONS),
                abandoned: count(builtin::ABANDONED_ITERATIONS),
                errors: count(builtin::ITERATION_ERRORS),
            },
            trends,
            counters,
            rates,
            thresholds: verdict.results.clone(),
        }
    }
}

struct Ms(Option<f64>);

impl fmt::Display for Ms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v:.2}ms"),
            None => f.write_str("-"),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "=== Load Test Summary ===")?;
        writeln!(
            f,
            "Duration:        {:.1}s (planned {:.1}s)",
            self.elapsed_secs, self.duration_secs
        )?;
        writeln!(f, "Total requests:  {}", self.requests.total)?;
        writeln!(f, "Avg RPS:         {:.0}", self.requests.rate)?;
        writeln!(f, "Failed:          {}", self.requests.failed)?;
        writeln!(
            f,
            "Iterations:      {} completed, {} dropped, {} abandoned, {} errors",
            self.iterations.completed,
            self.iterations.dropped,
            self.iterations.abandoned,
            self.iterations.errors
        )?;

        if let Some(d) = self.trends.get(builtin::HTTP_REQ_DURATION) {
            writeln!(f, "Median:          {}", Ms(d.med))?;
            writeln!(f, "p95:             {}", Ms(d.p95))?;
            writeln!(f, "p99:             {}", Ms(d.p99))?;
        }

        writeln!(f)?;
        for (name, t) in &self.trends {
            writeln!(
                f,
                "  {name:<24} count={} avg={} min={} med={} max={} p(90)={} p(95)={} p(99)={}",
                t.count,
                Ms(t.avg),
                Ms(t.min),
                Ms(t.med),
                Ms(t.max),
                Ms(t.p90),
                Ms(t.p95),
                Ms(t.p99)
            )?;
        }
        for (name, c) in &self.counters {
            writeln!(f, "  {name:<24} {} ({:.2}/s)", c.total, c.rate)?;
        }
        for (name, r) in &self.rates {
            match r.rate {
                Some(rate) => writeln!(
                    f,
                    "  {name:<24} {:.2}% ({} of {})",
                    rate * 100.0,
                    r.passes,
                    r.passes + r.fails
                )?,
                None => writeln!(f, "  {name:<24} -")?,
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f)?;
            writeln!(f, "Thresholds:")?;
            for t in &self.thresholds {
                let observed = t
                    .observed
                    .map_or_else(|| "no samples".to_string(), |v| format!("{v:.2}"));
                writeln!(
                    f,
                    "  [{}] {} {} (observed {observed})",
                    if t.passed { "PASS" } else { "FAIL" },
                    t.metric,
                    t.expression
                )?;
            }
        }
        writeln!(f)?;
        writeln!(
            f,
            "Result: {}",
            if self.passed { "PASSED" } else { "FAILED" }
        )
    }
}

/// A [`Reporter`] consumes a [`Summary`] and performs side effects: displaying it,
/// writing it somewhere, or sending it to a service.
///
/// # Example
/// ```rust
/// use volley::{Reporter, Summary};
///
/// struct Quiet;
///
/// impl Reporter for Quiet {
///     async fn report(&self, summary: &Summary) -> volley::Result<()> {
///         tracing::info!("passed: {}", summary.passed);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, summary: &Summary) -> impl Future<Output = Result<()>> + Send;
}

/// Prints the text rendering to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, summary: &Summary) -> Result<()> {
        print!("{summary}");
        Ok(())
    }
}

/// Writes the summary as pretty JSON to a file.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    pub path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, summary: &Summary) -> Result<()> {
        let json = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Summary written to {}", self.path.display());
        Ok(())
    }
}
