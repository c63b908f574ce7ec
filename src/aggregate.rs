use std::fmt::Debug;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// The `Aggregate` trait defines how raw sample values are collected and combined
/// into an intermediate, mergeable representation.
///
/// Every metric in the [`Registry`](crate::Registry) is split into shards and each
/// shard owns one aggregate. Writers only ever touch their own shard; a snapshot
/// clones every shard and merges the clones. That only works if `merge` is
/// **associative** and **commutative**, since shards are merged in arbitrary order and
/// samples from concurrent iterations arrive in arbitrary order.
///
/// # Memory vs accuracy
///
/// Aggregates embody a trade-off between memory use and analytic fidelity. The
/// built-in [`TrendAggregate`] uses an HDR histogram: memory grows with the dynamic
/// range of the data, never with the number of samples, and quantiles carry a bounded
/// relative error (see [`TREND_PRECISION`]).
///
/// # Example
/// ```rust
/// use volley::Aggregate;
///
/// #[derive(Debug, Clone)]
/// struct MaxAggregate(u64);
///
/// impl Aggregate for MaxAggregate {
///     type Value = u64;
///
///     fn new() -> Self {
///         Self(0)
///     }
///
///     fn consume(&mut self, value: &u64) {
///         self.0 = self.0.max(*value);
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.0 = self.0.max(other.0);
///     }
/// }
/// ```
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// The raw value type this aggregate summarizes.
    type Value;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple values into the current instance.
    fn aggregate(&mut self, values: &[Self::Value]) {
        values.iter().for_each(|v| self.consume(v));
    }

    /// Incorporate a single value into the aggregate.
    fn consume(&mut self, value: &Self::Value);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Running total of a counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterAggregate {
    pub total: f64,
    pub samples: u64,
}

impl Aggregate for CounterAggregate {
    type Value = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: &f64) {
        self.total += value;
        self.samples += 1;
    }

    fn merge(&mut self, other: Self) {
        self.total += other.total;
        self.samples += other.samples;
    }
}

/// Number of true and false samples of a rate metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateAggregate {
    pub passes: u64,
    pub fails: u64,
}

impl RateAggregate {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }

    /// Fraction of true samples, `None` when nothing was recorded.
    pub fn rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.passes as f64 / total as f64),
        }
    }
}

impl Aggregate for RateAggregate {
    type Value = bool;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: &bool) {
        if *value {
            self.passes += 1;
        } else {
            self.fails += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.passes += other.passes;
        self.fails += other.fails;
    }
}

/// Significant decimal digits kept by trend histograms.
const SIGNIFICANT_DIGITS: u8 = 3;

/// Trend values are stored as integers in thousandths of their unit.
const SCALE: f64 = 1_000.0;

/// Relative error bound of [`TrendAggregate::percentile`].
///
/// Percentiles are nearest-rank over the recorded samples, resolved through an HDR
/// histogram with three significant digits, then clamped to the exact observed
/// `[min, max]`. The result is within 0.1% (relative) of the true nearest-rank sample,
/// with an absolute floor of one thousandth of the unit.
pub const TREND_PRECISION: f64 = 0.001;

/// Distribution of a trend metric.
///
/// Exact count, sum, min and max are tracked alongside the histogram so averages and
/// extremes carry no quantization error.
#[derive(Clone)]
pub struct TrendAggregate {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendAggregate {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Nearest-rank percentile, `p` in `0..=100`. See [`TREND_PRECISION`].
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(quantile) as f64 / SCALE;
        Some(raw.clamp(self.min, self.max))
    }
}

impl Debug for TrendAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrendAggregate")
            .field("count", &self.count)
            .field("sum", &self.sum)
            .field("min", &self.min())
            .field("max", &self.max())
            .finish()
    }
}

impl Aggregate for TrendAggregate {
    type Value = f64;

    fn new() -> Self {
        Self {
            histogram: Histogram::new(SIGNIFICANT_DIGITS)
                .expect("three significant digits is a valid histogram precision"),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn consume(&mut self, value: &f64) {
        let value = *value;
        if let Err(e) = self.histogram.record((value * SCALE).round() as u64) {
            tracing::warn!("Dropping trend sample {value}: {e:?}");
            return;
        }
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: Self) {
        if other.count == 0 {
            return;
        }
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Failed to merge trend histograms: {e:?}");
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}
