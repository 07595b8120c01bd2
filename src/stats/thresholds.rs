//! Pass/fail criteria evaluated against the finalized report.
//!
//! Expressions take the form `<aggregation> <operator> <value>`, e.g.
//! `p(95) < 500` or `rate<0.01`. Latency values are milliseconds.

use std::fmt;

use crate::cli::config::ConfigError;
use crate::stats::ReportStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Operator {
    fn holds(self, actual: f64, expected: f64) -> bool {
        match self {
            Operator::Lt => actual < expected,
            Operator::Le => actual <= expected,
            Operator::Gt => actual > expected,
            Operator::Ge => actual >= expected,
            Operator::Eq => (actual - expected).abs() < f64::EPSILON,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
        }
    }
}

/// A (metric, aggregation) pair that can be read off a [`ReportStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    DurationAvg,
    DurationMin,
    DurationMax,
    DurationP50,
    DurationP90,
    DurationP95,
    DurationP99,
    FailedRate,
    ChecksRate,
    IterationsCount,
    IterationAvg,
    IterationP95,
    IterationP99,
    IterationMax,
    RequestsCount,
    RequestsRate,
}

impl Source {
    fn lookup(metric: &str, aggregation: &str) -> Option<Self> {
        let source = match (metric, aggregation) {
            ("http_req_duration", "avg") => Source::DurationAvg,
            ("http_req_duration", "min") => Source::DurationMin,
            ("http_req_duration", "max") => Source::DurationMax,
            ("http_req_duration", "p50" | "med") => Source::DurationP50,
            ("http_req_duration", "p90") => Source::DurationP90,
            ("http_req_duration", "p95") => Source::DurationP95,
            ("http_req_duration", "p99") => Source::DurationP99,
            ("http_req_failed", "rate") => Source::FailedRate,
            ("checks", "rate") => Source::ChecksRate,
            ("iterations", "count") => Source::IterationsCount,
            ("iteration_duration", "avg") => Source::IterationAvg,
            ("iteration_duration", "p95") => Source::IterationP95,
            ("iteration_duration", "p99") => Source::IterationP99,
            ("iteration_duration", "max") => Source::IterationMax,
            ("http_reqs", "count") => Source::RequestsCount,
            ("http_reqs", "rate") => Source::RequestsRate,
            _ => return None,
        };
        Some(source)
    }

    fn read(self, report: &ReportStats) -> f64 {
        match self {
            Source::DurationAvg => report.avg_latency_ms,
            Source::DurationMin => report.min_latency_ms,
            Source::DurationMax => report.max_latency_ms,
            Source::DurationP50 => report.p50_latency_ms,
            Source::DurationP90 => report.p90_latency_ms,
            Source::DurationP95 => report.p95_latency_ms,
            Source::DurationP99 => report.p99_latency_ms,
            Source::FailedRate => report.failure_rate,
            Source::ChecksRate => report.check_pass_rate,
            Source::IterationsCount => report.iterations as f64,
            Source::IterationAvg => report.avg_iteration_ms,
            Source::IterationP95 => report.p95_iteration_ms,
            Source::IterationP99 => report.p99_iteration_ms,
            Source::IterationMax => report.max_iteration_ms,
            Source::RequestsCount => report.total_requests as f64,
            Source::RequestsRate => report.requests_per_sec,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expr: String,
    source: Source,
    operator: Operator,
    value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdFailure {
    pub metric: String,
    pub expr: String,
    pub actual: f64,
}

impl fmt::Display for ThresholdFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Threshold FAILED: {} {} (actual: {:.2})",
            self.metric, self.expr, self.actual
        )
    }
}

/// `p(95)` and `p95` name the same aggregation.
fn normalize_aggregation(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix("p(").and_then(|r| r.strip_suffix(')')) {
        Some(pct) => format!("p{}", pct.trim()),
        None => raw.to_string(),
    }
}

fn split_operator(expr: &str) -> Option<(&str, Operator, &str)> {
    let pos = expr.find(['<', '>', '='])?;
    let rest = &expr[pos..];
    let (operator, len) = if rest.starts_with("<=") {
        (Operator::Le, 2)
    } else if rest.starts_with(">=") {
        (Operator::Ge, 2)
    } else if rest.starts_with("==") {
        (Operator::Eq, 2)
    } else if rest.starts_with('<') {
        (Operator::Lt, 1)
    } else if rest.starts_with('>') {
        (Operator::Gt, 1)
    } else {
        return None;
    };
    Some((&expr[..pos], operator, &rest[len..]))
}

impl Threshold {
    pub fn parse(metric: &str, expr: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, operator, rhs) =
            split_operator(expr).ok_or_else(|| invalid("expected one of < <= > >= =="))?;
        let aggregation = normalize_aggregation(lhs);
        let source = Source::lookup(metric, &aggregation)
            .ok_or_else(|| invalid("unsupported metric or aggregation"))?;
        let value: f64 = rhs
            .trim()
            .parse()
            .map_err(|_| invalid("threshold value is not a number"))?;
        if !value.is_finite() {
            return Err(invalid("threshold value is not finite"));
        }

        Ok(Self {
            metric: metric.to_string(),
            expr: expr.trim().to_string(),
            source,
            operator,
            value,
        })
    }

    pub fn actual(&self, report: &ReportStats) -> f64 {
        self.source.read(report)
    }

    pub fn passes(&self, report: &ReportStats) -> bool {
        self.operator.holds(self.actual(report), self.value)
    }

    pub fn operator(&self) -> &'static str {
        self.operator.as_str()
    }
}

pub fn evaluate(thresholds: &[Threshold], report: &ReportStats) -> Vec<ThresholdFailure> {
    thresholds
        .iter()
        .filter(|t| !t.passes(report))
        .map(|t| ThresholdFailure {
            metric: t.metric.clone(),
            expr: t.expr.clone(),
            actual: t.actual(report),
        })
        .collect()
}
