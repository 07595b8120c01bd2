use std::sync::Arc;
use std::time::Duration;

use crate::engine::check::Check;
use crate::engine::executor::{RequestExecutor, RequestSpec};
use crate::engine::schedule::StageScheduler;
use crate::stats::thresholds::Threshold;

/// The body of one virtual-user iteration: a batch of requests issued
/// concurrently, with the checks evaluated against each response.
#[derive(Debug, Clone, Default)]
pub struct Iteration {
    requests: Vec<RequestSpec>,
    checks: Vec<Vec<Check>>,
}

impl Iteration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: RequestSpec, checks: Vec<Check>) {
        self.requests.push(request);
        self.checks.push(checks);
    }

    pub fn with_request(mut self, request: RequestSpec, checks: Vec<Check>) -> Self {
        self.push(request, checks);
        self
    }

    pub fn requests(&self) -> &[RequestSpec] {
        &self.requests
    }

    pub fn checks_for(&self, index: usize) -> &[Check] {
        self.checks.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub request_timeout: Duration,
    /// Iterations shorter than this sleep for the remainder.
    pub min_iteration_duration: Option<Duration>,
    pub graceful_stop: Duration,
    pub tick: Duration,
    pub response_sink: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            request_timeout: RequestExecutor::DEFAULT_TIMEOUT,
            min_iteration_duration: None,
            graceful_stop: Duration::from_secs(30),
            tick: Duration::from_secs(1),
            response_sink: false,
        }
    }
}

/// A validated, runnable load test.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub schedule: StageScheduler,
    pub iteration: Iteration,
    pub options: RunOptions,
    pub thresholds: Vec<Threshold>,
}

impl Scenario {
    pub fn new(schedule: StageScheduler, iteration: Iteration) -> Self {
        Self {
            schedule,
            iteration,
            options: RunOptions::default(),
            thresholds: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<Threshold>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub(crate) fn shared_iteration(&self) -> Arc<Iteration> {
        Arc::new(self.iteration.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schedule::Stage;

    #[test]
    fn test_iteration_keeps_checks_aligned() {
        let iteration = Iteration::new()
            .with_request(
                RequestSpec::get("http://a.test/").unwrap(),
                vec![Check::status_is("a ok", 200)],
            )
            .with_request(RequestSpec::get("http://b.test/").unwrap(), vec![]);

        assert_eq!(iteration.len(), 2);
        assert_eq!(iteration.checks_for(0)[0].name(), "a ok");
        assert!(iteration.checks_for(1).is_empty());
        assert!(iteration.checks_for(5).is_empty());
    }

    #[test]
    fn test_default_options() {
        let schedule =
            StageScheduler::new(0, vec![Stage::new(Duration::from_secs(1), 1)]).unwrap();
        let scenario = Scenario::new(schedule, Iteration::new());
        assert_eq!(scenario.options.request_timeout, Duration::from_secs(30));
        assert_eq!(scenario.options.graceful_stop, Duration::from_secs(30));
        assert_eq!(scenario.options.tick, Duration::from_secs(1));
        assert!(scenario.thresholds.is_empty());
    }
}
