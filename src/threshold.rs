//! Threshold expressions and their evaluation against a [`RunSnapshot`].
//!
//! An expression is `<selector> <op> <bound>`, for example `p(95)<500`,
//! `rate<0.01` or `avg <= 1.5s`.
//!
//! | metric kind | selectors                               |
//! |-------------|-----------------------------------------|
//! | counter     | `count`, `rate` (per second of run)     |
//! | rate        | `rate` (fraction of true samples)       |
//! | trend       | `avg`, `min`, `max`, `med`, `p(N)`      |
//!
//! Bounds on trends may carry a time unit (`us`, `ms`, `s`, `m`), normalized to
//! milliseconds. A `%` suffix divides the bound by 100.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::Serialize;

use crate::{
    error::{Error, Result},
    metric::{MetricKind, MetricValues, RunSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selector {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Selector {
    fn applies_to(self, kind: MetricKind) -> bool {
        match self {
            Self::Count => kind == MetricKind::Counter,
            Self::Rate => matches!(kind, MetricKind::Counter | MetricKind::Rate),
            _ => kind == MetricKind::Trend,
        }
    }
}

impl FromStr for Selector {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        Ok(match s {
            "count" => Self::Count,
            "rate" => Self::Rate,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "med" => Self::Med,
            _ => {
                let p = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown selector `{s}`"))?;
                let p: f64 = p
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{p}`"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Self::Percentile(p)
            }
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        })
    }
}

/// One parsed threshold expression bound to a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    /// The expression as written.
    pub source: String,
    pub selector: Selector,
    pub op: Operator,
    pub bound: f64,
}

impl Threshold {
    pub fn parse(metric: impl Into<String>, expr: &str) -> Result<Self> {
        let invalid = |reason: String| Error::threshold(expr, reason);

        let at = expr
            .find(['<', '>'])
            .ok_or_else(|| invalid("missing comparison operator".into()))?;
        let (lhs, rest) = expr.split_at(at);
        let (op, rhs) = match rest.as_bytes() {
            [b'<', b'=', ..] => (Operator::Le, &rest[2..]),
            [b'>', b'=', ..] => (Operator::Ge, &rest[2..]),
            [b'<', ..] => (Operator::Lt, &rest[1..]),
            _ => (Operator::Gt, &rest[1..]),
        };

        let selector: Selector = lhs.trim().parse().map_err(invalid)?;
        let (bound, unit) = parse_bound(rhs.trim()).map_err(invalid)?;
        let bound = match unit {
            Unit::None => bound,
            Unit::Percent => bound / 100.0,
            Unit::Millis(factor) if matches!(selector, Selector::Count | Selector::Rate) => {
                return Err(invalid(format!(
                    "time unit on `{selector}` (x{factor} ms) makes no sense"
                )));
            }
            Unit::Millis(factor) => bound * factor,
        };

        Ok(Self {
            metric: metric.into(),
            source: expr.to_string(),
            selector,
            op,
            bound,
        })
    }

    /// Fails unless the selector can be computed for a metric of `kind`.
    pub fn check_kind(&self, kind: MetricKind) -> Result<()> {
        if self.selector.applies_to(kind) {
            return Ok(());
        }
        Err(Error::threshold(
            &self.source,
            format!(
                "selector `{}` does not apply to {} metric `{}`",
                self.selector, kind, self.metric
            ),
        ))
    }

    /// The value the selector reads from `snapshot`, `None` when there is nothing to
    /// observe (no samples yet).
    pub fn observe(&self, snapshot: &RunSnapshot) -> Option<f64> {
        match (snapshot.get(&self.metric)?, self.selector) {
            (MetricValues::Counter(c), Selector::Count) => Some(c.total),
            (MetricValues::Counter(c), Selector::Rate) => {
                let secs = snapshot.elapsed().as_secs_f64();
                Some(if secs > 0.0 { c.total / secs } else { 0.0 })
            }
            (MetricValues::Rate(r), Selector::Rate) => r.rate(),
            (MetricValues::Trend(t), Selector::Avg) => t.avg(),
            (MetricValues::Trend(t), Selector::Min) => t.min(),
            (MetricValues::Trend(t), Selector::Max) => t.max(),
            (MetricValues::Trend(t), Selector::Med) => t.median(),
            (MetricValues::Trend(t), Selector::Percentile(p)) => t.percentile(p),
            _ => None,
        }
    }

    /// An expression with nothing to observe passes.
    pub fn evaluate(&self, snapshot: &RunSnapshot) -> ThresholdResult {
        let observed = self.observe(snapshot);
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.source.clone(),
            observed,
            passed: observed.map_or(true, |v| self.op.holds(v, self.bound)),
        }
    }
}

enum Unit {
    None,
    Percent,
    Millis(f64),
}

fn parse_bound(s: &str) -> std::result::Result<(f64, Unit), String> {
    const UNITS: [(&str, f64); 4] = [("us", 0.001), ("ms", 1.0), ("s", 1_000.0), ("m", 60_000.0)];

    let (number, unit) = if let Some(n) = s.strip_suffix('%') {
        (n, Unit::Percent)
    } else {
        UNITS
            .iter()
            .find_map(|(suffix, factor)| s.strip_suffix(suffix).map(|n| (n, Unit::Millis(*factor))))
            .unwrap_or((s, Unit::None))
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid bound `{s}`"))?;
    if !value.is_finite() {
        return Err(format!("bound `{s}` is not a finite number"));
    }
    Ok((value, unit))
}

/// Outcome of one expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
}

/// Every threshold of a run, validated against the known metrics.
#[derive(Debug, Clone, Default)]
pub struct Thresholds(Vec<Threshold>);

impl Thresholds {
    /// Parses `metric -> expressions` and checks every metric exists with a kind the
    /// selectors apply to. `kind_of` resolves metric names.
    pub fn parse(
        exprs: &BTreeMap<String, Vec<String>>,
        kind_of: impl Fn(&str) -> Option<MetricKind>,
    ) -> Result<Self> {
        let mut thresholds = Vec::new();
        for (metric, list) in exprs {
            let kind = kind_of(metric).ok_or_else(|| Error::UnknownMetric(metric.clone()))?;
            for expr in list {
                let threshold = Threshold::parse(metric, expr)?;
                threshold.check_kind(kind)?;
                thresholds.push(threshold);
            }
        }
        Ok(Self(thresholds))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn evaluate(&self, snapshot: &RunSnapshot) -> Verdict {
        let results: Vec<_> = self.0.iter().map(|t| t.evaluate(snapshot)).collect();
        let passed = results.iter().all(|r| r.passed);
        Verdict { results, passed }
    }
}

/// Pass/fail of a run. Fails if any expression failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub results: Vec<ThresholdResult>,
    pub passed: bool,
}
