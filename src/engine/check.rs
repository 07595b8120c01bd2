use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{trace, warn};

use crate::engine::executor::Response;
use crate::stats::MetricsAggregator;

pub type Predicate = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

thread_local! {
    static EVALUATING: Cell<bool> = const { Cell::new(false) };
}

static QUIET_HOOK: Once = Once::new();

/// Wrap the process panic hook so panics raised inside a predicate are not
/// printed; they are reported once through `tracing` instead. Panics
/// anywhere else still reach the previous hook.
fn install_quiet_hook() {
    QUIET_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !is_evaluating() {
                previous(info);
            }
        }));
    });
}

fn is_evaluating() -> bool {
    EVALUATING.with(Cell::get)
}

/// A named boolean assertion over a response.
#[derive(Clone)]
pub struct Check {
    name: String,
    predicate: Predicate,
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

/// A predicate panicked while being evaluated.
#[derive(Debug, Error)]
#[error("check '{name}' panicked: {message}")]
pub struct CheckEvaluationError {
    pub name: String,
    pub message: String,
}

impl Check {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&Response) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn status_is(name: impl Into<String>, status: u16) -> Self {
        Self::new(name, move |r| r.status == status)
    }

    pub fn is_success(name: impl Into<String>) -> Self {
        Self::new(name, |r| (200..300).contains(&r.status))
    }

    pub fn body_contains(name: impl Into<String>, text: String) -> Self {
        Self::new(name, move |r| r.text().contains(text.as_str()))
    }

    pub fn has_header(name: impl Into<String>, header: String) -> Self {
        Self::new(name, move |r| r.headers.contains_key(header.as_str()))
    }

    pub fn latency_below(name: impl Into<String>, bound: Duration) -> Self {
        Self::new(name, move |r| r.latency < bound)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, response: &Response) -> Result<bool, CheckEvaluationError> {
        install_quiet_hook();
        EVALUATING.with(|flag| flag.set(true));
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.predicate)(response)));
        EVALUATING.with(|flag| flag.set(false));
        outcome.map_err(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            CheckEvaluationError {
                name: self.name.clone(),
                message,
            }
        })
    }
}

/// Evaluate every check in order. A panicking predicate counts as failed.
/// Checks sharing a name each produce their own result.
pub fn evaluate_checks(response: &Response, checks: &[Check]) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| {
            let passed = match check.run(response) {
                Ok(passed) => passed,
                Err(e) => {
                    warn!(error = %e, "check evaluation failed");
                    false
                }
            };
            CheckResult {
                name: check.name.clone(),
                passed,
            }
        })
        .collect()
}

/// Evaluates checks and forwards every result to the aggregator.
#[derive(Clone)]
pub struct CheckEngine {
    metrics: Arc<MetricsAggregator>,
}

impl CheckEngine {
    pub fn new(metrics: Arc<MetricsAggregator>) -> Self {
        Self { metrics }
    }

    pub fn evaluate(&self, vu_id: u64, response: &Response, checks: &[Check]) -> Vec<CheckResult> {
        let results = evaluate_checks(response, checks);
        for result in &results {
            if let Err(e) = self.metrics.record_check(vu_id, result) {
                trace!(vu = vu_id, error = %e, "check sample dropped");
            }
        }
        results
    }
}
