use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::engine::check::CheckEngine;
use crate::engine::executor::{RequestExecutor, Transport};
use crate::engine::scenario::{Iteration, RunOptions};
use crate::stats::MetricsAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl VuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VuState::Idle,
            1 => VuState::Running,
            _ => VuState::Stopping,
        }
    }
}

pub struct VirtualUser {
    id: u64,
    state: AtomicU8,
    stop: Notify,
}

impl VirtualUser {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(VuState::Idle as u8),
            stop: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn begin(&self) {
        // A stop can land before the task is first polled.
        let _ = self.state.compare_exchange(
            VuState::Idle as u8,
            VuState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn request_stop(&self) {
        self.state.store(VuState::Stopping as u8, Ordering::Release);
        // notify_one stores a permit, so a user that is not yet parked still wakes.
        self.stop.notify_one();
    }

    fn is_stopping(&self) -> bool {
        self.state() == VuState::Stopping
    }
}

/// Runs one iteration: the request batch, then the checks of every response.
pub struct IterationRunner {
    executor: RequestExecutor,
    checks: CheckEngine,
    iteration: Arc<Iteration>,
    metrics: Arc<MetricsAggregator>,
    pacing: Option<Duration>,
}

impl IterationRunner {
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsAggregator>,
        iteration: Arc<Iteration>,
        options: &RunOptions,
    ) -> Self {
        Self {
            executor: RequestExecutor::new(transport, metrics.clone(), options.request_timeout),
            checks: CheckEngine::new(metrics.clone()),
            iteration,
            metrics,
            pacing: options.min_iteration_duration,
        }
    }

    pub async fn run_iteration(&self, vu_id: u64) -> Duration {
        let start = Instant::now();
        let responses = self.executor.execute(vu_id, self.iteration.requests()).await;
        for (index, response) in responses.iter().enumerate() {
            self.checks
                .evaluate(vu_id, response, self.iteration.checks_for(index));
        }
        let elapsed = start.elapsed();
        if let Err(e) = self.metrics.record_iteration(vu_id, elapsed) {
            trace!(vu = vu_id, error = %e, "iteration sample dropped");
        }
        elapsed
    }
}

async fn user_loop(user: Arc<VirtualUser>, runner: Arc<IterationRunner>) {
    user.begin();
    while !user.is_stopping() {
        let elapsed = runner.run_iteration(user.id).await;
        if user.is_stopping() {
            break;
        }
        match runner.pacing.and_then(|min| min.checked_sub(elapsed)) {
            Some(rest) if !rest.is_zero() => {
                tokio::select! {
                    _ = tokio::time::sleep(rest) => {}
                    _ = user.stop.notified() => break,
                }
            }
            _ => tokio::task::yield_now().await,
        }
    }
    trace!(vu = user.id, "virtual user exited");
}

struct Member {
    user: Arc<VirtualUser>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownStats {
    pub graceful: usize,
    pub interrupted: usize,
}

/// Owns every virtual user. Ids are minted from 1 upwards and never reused;
/// scaling down retires the oldest users first.
pub struct VirtualUserPool {
    runner: Arc<IterationRunner>,
    metrics: Arc<MetricsAggregator>,
    active: VecDeque<Member>,
    retiring: Vec<Member>,
    next_id: u64,
    capacity: usize,
}

impl VirtualUserPool {
    pub fn new(runner: IterationRunner, capacity: usize) -> Self {
        let metrics = runner.metrics.clone();
        Self {
            runner: Arc::new(runner),
            metrics,
            active: VecDeque::new(),
            retiring: Vec::new(),
            next_id: 1,
            capacity,
        }
    }

    /// Spawn or retire users until exactly `min(target, capacity)` are active.
    pub fn scale_to(&mut self, target: usize) {
        let target = target.min(self.capacity);
        let current = self.active.len();

        if target > current {
            for _ in current..target {
                let user = Arc::new(VirtualUser::new(self.next_id));
                self.next_id += 1;
                let handle = tokio::spawn(user_loop(user.clone(), self.runner.clone()));
                self.active.push_back(Member { user, handle });
            }
            debug!(from = current, to = target, "scaled up");
        } else if target < current {
            for _ in target..current {
                if let Some(member) = self.active.pop_front() {
                    member.user.request_stop();
                    self.retiring.push(member);
                }
            }
            debug!(from = current, to = target, "scaled down");
        }

        if let Err(e) = self.metrics.observe_vus(self.active.len()) {
            trace!(error = %e, "vus sample dropped");
        }
    }

    /// Drop retired users whose task has exited. Active users whose task died
    /// unexpectedly are removed too and replaced on the next `scale_to`.
    pub fn reap(&mut self) -> usize {
        let before = self.retiring.len();
        self.retiring.retain(|m| !m.handle.is_finished());
        let reaped = before - self.retiring.len();

        self.active.retain(|m| {
            let finished = m.handle.is_finished();
            if finished {
                warn!(vu = m.user.id, "virtual user exited unexpectedly");
            }
            !finished
        });
        reaped
    }

    /// Stop every user, wait until `grace` has passed, then abort whatever is
    /// still running. Each aborted user counts as one interrupted iteration.
    /// A grace period too long to represent as a deadline waits indefinitely.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownStats {
        while let Some(member) = self.active.pop_front() {
            member.user.request_stop();
            self.retiring.push(member);
        }

        let deadline = Instant::now().checked_add(grace);
        let mut stats = ShutdownStats::default();
        for mut member in self.retiring.drain(..) {
            let finished = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, &mut member.handle)
                    .await
                    .is_ok(),
                None => {
                    let _ = (&mut member.handle).await;
                    true
                }
            };
            if finished {
                stats.graceful += 1;
            } else {
                member.handle.abort();
                stats.interrupted += 1;
                if let Err(e) = self.metrics.record_interrupted(member.user.id) {
                    trace!(vu = member.user.id, error = %e, "interrupt sample dropped");
                }
            }
        }
        debug!(
            graceful = stats.graceful,
            interrupted = stats.interrupted,
            "virtual users stopped"
        );
        stats
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn retiring_count(&self) -> usize {
        self.retiring.len()
    }

    pub fn active_ids(&self) -> Vec<u64> {
        self.active.iter().map(|m| m.user.id).collect()
    }

    pub fn state_of(&self, id: u64) -> Option<VuState> {
        self.active
            .iter()
            .chain(self.retiring.iter())
            .find(|m| m.user.id == id)
            .map(|m| m.user.state())
    }
}
