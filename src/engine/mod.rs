use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::control::ControlState;
use crate::engine::executor::Transport;
use crate::engine::http_client::HttpClient;
use crate::engine::pool::{IterationRunner, ShutdownStats, VirtualUserPool};
use crate::engine::scenario::Scenario;
use crate::stats::thresholds::{self, ThresholdFailure};
use crate::stats::{MetricsAggregator, ReportStats};

pub mod check;
pub mod control;
pub mod executor;
pub mod http_client;
pub mod pool;
pub mod scenario;
pub mod schedule;

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report: Arc<ReportStats>,
    pub threshold_failures: Vec<ThresholdFailure>,
    pub shutdown: ShutdownStats,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.threshold_failures.is_empty()
    }
}

pub struct Engine {
    scenario: Scenario,
    transport: Arc<dyn Transport>,
}

impl Engine {
    pub fn new(scenario: Scenario, transport: Arc<dyn Transport>) -> Self {
        Self {
            scenario,
            transport,
        }
    }

    /// Engine backed by the pooled HTTP client, sized for the scenario's peak.
    // Must be called inside a Tokio Runtime
    pub fn with_http_client(scenario: Scenario) -> Self {
        let users = scenario.schedule.max_target();
        let client = HttpClient::with_pool_and_workers(HttpClient::pool_size_for(users), users)
            .with_response_sink(scenario.options.response_sink);
        Self::new(scenario, Arc::new(client))
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Runtime worker threads for a run peaking at `max_users`.
    /// Small runs stay within the available cores; large runs get about one
    /// thread per 50-75 users so task queues stay short.
    pub fn runtime_threads(max_users: usize) -> usize {
        let base_parallelism = num_cpus::get().max(1);
        if max_users > 5000 {
            (max_users / 75).max(base_parallelism * 2).min(128)
        } else if max_users > 1000 {
            (max_users / 50).max(base_parallelism).min(64)
        } else {
            base_parallelism.min(max_users.max(2))
        }
    }

    /// Drive the schedule to completion (or until `control` is stopped), then
    /// stop every user, finalize metrics and evaluate thresholds.
    pub async fn run(&self, control: Arc<ControlState>) -> RunSummary {
        let schedule = &self.scenario.schedule;
        let options = &self.scenario.options;
        let max_users = schedule.max_target();

        let metrics = Arc::new(MetricsAggregator::for_concurrency(max_users));
        let runner = IterationRunner::new(
            self.transport.clone(),
            metrics.clone(),
            self.scenario.shared_iteration(),
            options,
        );
        let mut pool = VirtualUserPool::new(runner, max_users);

        info!(
            stages = schedule.stages().len(),
            max_vus = max_users,
            duration = ?schedule.total_duration(),
            requests_per_iteration = self.scenario.iteration.len(),
            "starting load test"
        );

        let start = Instant::now();
        let mut ticker = tokio::time::interval(options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = control.stopped() => {
                    info!("stop requested");
                    break;
                }
            }

            let elapsed = start.elapsed();
            if schedule.is_complete(elapsed) {
                break;
            }
            pool.reap();
            let target = schedule.target_at(elapsed);
            if target != pool.active_count() {
                debug!(elapsed = ?elapsed, target_vus = target, active = pool.active_count(), "tick");
            }
            pool.scale_to(target);
        }

        info!(
            active = pool.active_count(),
            grace = ?options.graceful_stop,
            "stopping virtual users"
        );
        let shutdown = pool.shutdown(options.graceful_stop).await;
        if shutdown.interrupted > 0 {
            warn!(
                interrupted = shutdown.interrupted,
                "virtual users did not finish within the graceful stop period"
            );
        }

        let report = metrics.finalize();
        let threshold_failures = thresholds::evaluate(&self.scenario.thresholds, &report);
        for failure in &threshold_failures {
            warn!("{}", failure);
        }
        info!(
            requests = report.total_requests,
            failure_rate = report.failure_rate,
            check_pass_rate = report.check_pass_rate,
            "load test finished"
        );

        RunSummary {
            report,
            threshold_failures,
            shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::check::Check;
    use crate::engine::executor::mock::MockTransport;
    use crate::engine::executor::RequestSpec;
    use crate::engine::scenario::{Iteration, RunOptions};
    use crate::engine::schedule::{Stage, StageScheduler};
    use crate::stats::thresholds::Threshold;
    use http::StatusCode;
    use std::time::Duration;

    fn scenario(stages: Vec<Stage>, options: RunOptions) -> Scenario {
        let mut iteration = Iteration::new();
        for path in ["/a", "/b"] {
            iteration.push(
                RequestSpec::get(&format!("http://target.test{}", path)).unwrap(),
                vec![Check::status_is(format!("{} status is 200", path), 200)],
            );
        }
        Scenario::new(StageScheduler::new(0, stages).unwrap(), iteration).with_options(options)
    }

    fn fast_ticks() -> RunOptions {
        RunOptions {
            tick: Duration::from_millis(100),
            graceful_stop: Duration::from_secs(5),
            ..RunOptions::default()
        }
    }

    #[test]
    fn test_runtime_threads_bounds() {
        let cpus = num_cpus::get().max(1);
        assert!(Engine::runtime_threads(1) <= cpus.max(2));
        assert!(Engine::runtime_threads(3_000) <= 64);
        assert!(Engine::runtime_threads(100_000) <= 128);
        assert!(Engine::runtime_threads(100_000) >= cpus * 2 || cpus * 2 > 128);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_against_failing_target_completes() {
        let transport = Arc::new(MockTransport::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            Duration::from_millis(50),
        ));
        let engine = Engine::new(
            scenario(
                vec![
                    Stage::new(Duration::from_secs(2), 4),
                    Stage::new(Duration::from_secs(1), 0),
                ],
                fast_ticks(),
            ),
            transport.clone(),
        );

        let summary = engine.run(Arc::new(ControlState::new())).await;
        let report = &summary.report;

        assert!(report.total_requests > 0);
        assert_eq!(report.failed_requests, report.total_requests);
        assert_eq!(report.failure_rate, 1.0);
        assert_eq!(report.check_pass_rate, 0.0);
        assert_eq!(report.status_codes.get(&500), Some(&report.total_requests));
        assert_eq!(report.vus_max, 4);
        assert_eq!(report.total_requests, transport.calls());
        assert_eq!(report.checks["/a status is 200"].1, 0);
        assert_eq!(report.grouped_requests.len(), 2);
        assert_eq!(summary.shutdown.interrupted, 0);
        assert!(summary.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_request_pairs_with_checks() {
        let transport = Arc::new(MockTransport::new(StatusCode::OK, Duration::from_millis(30)));
        let engine = Engine::new(
            scenario(vec![Stage::new(Duration::from_secs(1), 3)], fast_ticks()),
            transport,
        );

        let summary = engine.run(Arc::new(ControlState::new())).await;
        let report = &summary.report;
        let total_checks = report.checks_passed + report.checks_failed;

        assert_eq!(total_checks, report.total_requests);
        assert_eq!(report.check_pass_rate, 1.0);
        assert_eq!(report.iterations * 2, report.total_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_stop_ends_run_early() {
        let transport = Arc::new(MockTransport::new(StatusCode::OK, Duration::from_millis(20)));
        let engine = Engine::new(
            scenario(
                vec![
                    Stage::new(Duration::ZERO, 5),
                    Stage::new(Duration::from_secs(3600), 5),
                ],
                fast_ticks(),
            ),
            transport,
        );
        let control = Arc::new(ControlState::new());
        {
            let control = control.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                control.stop();
            });
        }

        let start = Instant::now();
        let summary = engine.run(control).await;
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(summary.report.total_requests > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_deadline_counts_interrupted() {
        let transport = Arc::new(MockTransport::new(StatusCode::OK, Duration::from_secs(600)));
        let options = RunOptions {
            graceful_stop: Duration::from_secs(1),
            ..fast_ticks()
        };
        let engine = Engine::new(
            scenario(
                vec![
                    Stage::new(Duration::ZERO, 2),
                    Stage::new(Duration::from_secs(1), 2),
                ],
                options,
            ),
            transport,
        );

        let summary = engine.run(Arc::new(ControlState::new())).await;
        assert_eq!(summary.shutdown.interrupted, 2);
        assert_eq!(summary.report.interrupted_iterations, 2);
        assert_eq!(summary.report.total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_graceful_stop_still_finalizes() {
        let transport = Arc::new(MockTransport::new(StatusCode::OK, Duration::from_millis(40)));
        let options = RunOptions {
            graceful_stop: Duration::MAX,
            ..fast_ticks()
        };
        let engine = Engine::new(
            scenario(
                vec![
                    Stage::new(Duration::ZERO, 2),
                    Stage::new(Duration::from_millis(300), 2),
                ],
                options,
            ),
            transport,
        );

        let summary = engine.run(Arc::new(ControlState::new())).await;
        assert_eq!(summary.shutdown.graceful, 2);
        assert_eq!(summary.shutdown.interrupted, 0);
        assert!(summary.report.total_requests > 0);
        assert_eq!(summary.report.iterations * 2, summary.report.total_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_failures_reported() {
        let transport = Arc::new(MockTransport::new(
            StatusCode::SERVICE_UNAVAILABLE,
            Duration::from_millis(50),
        ));
        let thresholds = vec![
            Threshold::parse("http_req_failed", "rate < 0.01").unwrap(),
            Threshold::parse("http_req_duration", "p(95) < 1000").unwrap(),
        ];
        let engine = Engine::new(
            scenario(vec![Stage::new(Duration::from_secs(1), 2)], fast_ticks())
                .with_thresholds(thresholds),
            transport,
        );

        let summary = engine.run(Arc::new(ControlState::new())).await;
        assert!(!summary.passed());
        assert_eq!(summary.threshold_failures.len(), 1);
        assert_eq!(summary.threshold_failures[0].metric, "http_req_failed");
    }
}
