use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::engine::check::CheckResult;
use crate::engine::executor::Response;

pub mod thresholds;

/// Returned for every write attempted after [`MetricsAggregator::finalize`].
/// Writes are rejected, never applied; callers treat it as a dropped sample.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("metrics already finalized")]
    Finalized,
}

/// Latency histogram in microseconds, 1µs..1h, 2 significant digits.
fn latency_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2)
        .expect("static histogram bounds are valid")
}

fn quantile_ms(h: &Histogram<u64>, q: f64) -> f64 {
    if h.is_empty() {
        return 0.0;
    }
    Duration::from_micros(h.value_at_quantile(q)).as_secs_f64() * 1000.0
}

#[derive(Debug, Clone)]
pub enum Metric {
    Request {
        name: String,
        latency: Duration,
        status: u16,
        error: Option<String>,
        bytes_received: usize,
    },
    Check {
        name: String,
        success: bool,
    },
    Iteration {
        duration: Duration,
    },
    InterruptedIteration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReport {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
}

/// Frozen result of a run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportStats {
    pub elapsed_secs: f64,
    pub total_requests: usize,
    pub failed_requests: usize,
    pub failure_rate: f64,
    pub requests_per_sec: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub status_codes: HashMap<u16, usize>,
    pub errors: HashMap<String, usize>,
    /// name -> (total, passes)
    pub checks: HashMap<String, (usize, usize)>,
    pub checks_passed: usize,
    pub checks_failed: usize,
    /// Passed over evaluated checks; 0 when no check ran.
    pub check_pass_rate: f64,
    pub grouped_requests: HashMap<String, RequestReport>,
    pub iterations: usize,
    pub interrupted_iterations: usize,
    pub avg_iteration_ms: f64,
    pub p95_iteration_ms: f64,
    pub p99_iteration_ms: f64,
    pub max_iteration_ms: f64,
    pub vus_max: usize,
    pub data_received: u64,
}

pub struct RequestStats {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Duration,
    pub histogram: Histogram<u64>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            failed_requests: 0,
            total_duration: Duration::ZERO,
            min_duration: None,
            max_duration: Duration::ZERO,
            histogram: latency_histogram(),
        }
    }

    fn record(&mut self, latency: Duration, failed: bool) {
        self.total_requests += 1;
        self.total_duration += latency;
        if self.min_duration.map_or(true, |min| latency < min) {
            self.min_duration = Some(latency);
        }
        if latency > self.max_duration {
            self.max_duration = latency;
        }
        let _ = self.histogram.record((latency.as_micros() as u64).max(1));
        if failed {
            self.failed_requests += 1;
        }
    }

    fn merge(&mut self, other: &RequestStats) {
        self.total_requests += other.total_requests;
        self.failed_requests += other.failed_requests;
        self.total_duration += other.total_duration;
        if let Some(other_min) = other.min_duration {
            if self.min_duration.map_or(true, |min| other_min < min) {
                self.min_duration = Some(other_min);
            }
        }
        if other.max_duration > self.max_duration {
            self.max_duration = other.max_duration;
        }
        self.histogram.add(&other.histogram).ok();
    }

    fn avg_ms(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_duration.as_secs_f64() * 1000.0 / self.total_requests as f64
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-writer accumulator; [`MetricsAggregator`] keeps one per shard.
pub struct StatsAggregator {
    pub requests: RequestStats,
    pub status_codes: HashMap<u16, usize>,
    pub errors: HashMap<String, usize>,
    pub checks: HashMap<String, (usize, usize)>,
    pub grouped: HashMap<String, RequestStats>,
    pub data_received: u64,
    pub iterations: RequestStats,
    pub interrupted_iterations: usize,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            requests: RequestStats::new(),
            status_codes: HashMap::new(),
            errors: HashMap::new(),
            checks: HashMap::new(),
            grouped: HashMap::new(),
            data_received: 0,
            iterations: RequestStats::new(),
            interrupted_iterations: 0,
        }
    }

    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Request {
                name,
                latency,
                status,
                error,
                bytes_received,
            } => {
                let failed = error.is_some();
                self.requests.record(latency, failed);
                *self.status_codes.entry(status).or_insert(0) += 1;
                if let Some(err) = error {
                    *self.errors.entry(err).or_insert(0) += 1;
                }
                self.grouped.entry(name).or_default().record(latency, failed);
                self.data_received += bytes_received as u64;
            }
            Metric::Check { name, success } => {
                let entry = self.checks.entry(name).or_insert((0, 0));
                entry.0 += 1;
                if success {
                    entry.1 += 1;
                }
            }
            Metric::Iteration { duration } => {
                self.iterations.record(duration, false);
            }
            Metric::InterruptedIteration => {
                self.interrupted_iterations += 1;
            }
        }
    }

    pub fn merge(&mut self, other: &StatsAggregator) {
        self.requests.merge(&other.requests);
        for (code, count) in &other.status_codes {
            *self.status_codes.entry(*code).or_insert(0) += count;
        }
        for (err, count) in &other.errors {
            *self.errors.entry(err.clone()).or_insert(0) += count;
        }
        for (name, (total, passes)) in &other.checks {
            let entry = self.checks.entry(name.clone()).or_insert((0, 0));
            entry.0 += total;
            entry.1 += passes;
        }
        for (name, stats) in &other.grouped {
            self.grouped.entry(name.clone()).or_default().merge(stats);
        }
        self.data_received += other.data_received;
        self.iterations.merge(&other.iterations);
        self.interrupted_iterations += other.interrupted_iterations;
    }

    pub fn to_report(&self, elapsed: Duration, vus_max: usize) -> ReportStats {
        let total = self.requests.total_requests;
        let failed = self.requests.failed_requests;
        let elapsed_secs = elapsed.as_secs_f64();

        let grouped_requests = self
            .grouped
            .iter()
            .map(|(name, stats)| {
                (
                    name.clone(),
                    RequestReport {
                        total_requests: stats.total_requests,
                        failed_requests: stats.failed_requests,
                        min_latency_ms: stats.min_duration.unwrap_or_default().as_secs_f64()
                            * 1000.0,
                        max_latency_ms: stats.max_duration.as_secs_f64() * 1000.0,
                        avg_latency_ms: stats.avg_ms(),
                        p95_latency_ms: quantile_ms(&stats.histogram, 0.95),
                        p99_latency_ms: quantile_ms(&stats.histogram, 0.99),
                    },
                )
            })
            .collect();

        let checks_total: usize = self.checks.values().map(|(t, _)| t).sum();
        let checks_passed: usize = self.checks.values().map(|(_, p)| p).sum();

        ReportStats {
            elapsed_secs,
            total_requests: total,
            failed_requests: failed,
            failure_rate: if total > 0 {
                failed as f64 / total as f64
            } else {
                0.0
            },
            requests_per_sec: if elapsed_secs > 0.0 {
                total as f64 / elapsed_secs
            } else {
                0.0
            },
            avg_latency_ms: self.requests.avg_ms(),
            min_latency_ms: self.requests.min_duration.unwrap_or_default().as_secs_f64() * 1000.0,
            max_latency_ms: self.requests.max_duration.as_secs_f64() * 1000.0,
            p50_latency_ms: quantile_ms(&self.requests.histogram, 0.5),
            p90_latency_ms: quantile_ms(&self.requests.histogram, 0.9),
            p95_latency_ms: quantile_ms(&self.requests.histogram, 0.95),
            p99_latency_ms: quantile_ms(&self.requests.histogram, 0.99),
            status_codes: self.status_codes.clone(),
            errors: self.errors.clone(),
            checks: self.checks.clone(),
            checks_passed,
            checks_failed: checks_total - checks_passed,
            check_pass_rate: if checks_total > 0 {
                checks_passed as f64 / checks_total as f64
            } else {
                0.0
            },
            grouped_requests,
            iterations: self.iterations.total_requests,
            interrupted_iterations: self.interrupted_iterations,
            avg_iteration_ms: self.iterations.avg_ms(),
            p95_iteration_ms: quantile_ms(&self.iterations.histogram, 0.95),
            p99_iteration_ms: quantile_ms(&self.iterations.histogram, 0.99),
            max_iteration_ms: self.iterations.max_duration.as_secs_f64() * 1000.0,
            vus_max,
            data_received: self.data_received,
        }
    }
}

/// Process-wide metrics sink for one run, shared by handle with every
/// virtual user. Samples are spread over lock-protected shards keyed by
/// virtual-user id; the `finalized` gate is read-locked for every write and
/// write-locked by [`finalize`](Self::finalize), so a write either lands
/// before the freeze or is rejected with [`MetricsError::Finalized`].
pub struct MetricsAggregator {
    shards: Vec<RwLock<StatsAggregator>>,
    finalized: RwLock<bool>,
    vus_max: AtomicUsize,
    started: Instant,
    snapshot: OnceLock<Arc<ReportStats>>,
}

impl MetricsAggregator {
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        Self {
            shards: (0..num_shards)
                .map(|_| RwLock::new(StatsAggregator::new()))
                .collect(),
            finalized: RwLock::new(false),
            vus_max: AtomicUsize::new(0),
            started: Instant::now(),
            snapshot: OnceLock::new(),
        }
    }

    /// Roughly 100 users per shard, between 16 and 256 shards.
    pub fn for_concurrency(max_users: usize) -> Self {
        Self::new((max_users / 100).clamp(16, 256))
    }

    fn add(&self, key: u64, metric: Metric) -> Result<(), MetricsError> {
        let finalized = self.finalized.read();
        if *finalized {
            return Err(MetricsError::Finalized);
        }
        let shard = (key % self.shards.len() as u64) as usize;
        self.shards[shard].write().add(metric);
        Ok(())
    }

    pub fn record_request(
        &self,
        vu_id: u64,
        name: &str,
        response: &Response,
    ) -> Result<(), MetricsError> {
        self.add(
            vu_id,
            Metric::Request {
                name: name.to_string(),
                latency: response.latency,
                status: response.status,
                error: response.failure.as_ref().map(|f| f.to_string()),
                bytes_received: response.body_size,
            },
        )
    }

    pub fn record_check(&self, vu_id: u64, result: &CheckResult) -> Result<(), MetricsError> {
        self.add(
            vu_id,
            Metric::Check {
                name: result.name.clone(),
                success: result.passed,
            },
        )
    }

    pub fn record_iteration(&self, vu_id: u64, duration: Duration) -> Result<(), MetricsError> {
        self.add(vu_id, Metric::Iteration { duration })
    }

    pub fn record_interrupted(&self, vu_id: u64) -> Result<(), MetricsError> {
        self.add(vu_id, Metric::InterruptedIteration)
    }

    pub fn observe_vus(&self, active: usize) -> Result<(), MetricsError> {
        let finalized = self.finalized.read();
        if *finalized {
            return Err(MetricsError::Finalized);
        }
        self.vus_max.fetch_max(active, Ordering::Relaxed);
        Ok(())
    }

    /// Freeze the aggregator and return the merged snapshot. Idempotent.
    pub fn finalize(&self) -> Arc<ReportStats> {
        let mut finalized = self.finalized.write();
        *finalized = true;
        self.snapshot
            .get_or_init(|| {
                let mut merged = StatsAggregator::new();
                for shard in &self.shards {
                    merged.merge(&shard.read());
                }
                Arc::new(merged.to_report(
                    self.started.elapsed(),
                    self.vus_max.load(Ordering::Relaxed),
                ))
            })
            .clone()
    }

    pub fn is_finalized(&self) -> bool {
        *self.finalized.read()
    }

    pub fn snapshot(&self) -> Option<Arc<ReportStats>> {
        self.snapshot.get().cloned()
    }
}

impl ReportStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print_summary(&self) {
        println!("\n--- Test Summary ---");
        if self.total_requests == 0 && self.checks.is_empty() {
            println!("No metrics collected.");
            println!("--------------------\n");
            return;
        }

        println!("Duration:       {:.1}s", self.elapsed_secs);
        println!("Peak VUs:       {}", self.vus_max);
        println!(
            "Iterations:     {} ({} interrupted)",
            self.iterations, self.interrupted_iterations
        );
        println!("Total Requests: {}", self.total_requests);
        println!("Throughput:     {:.2} req/s", self.requests_per_sec);
        println!(
            "Failed:         {} ({:.2}%)",
            self.failed_requests,
            self.failure_rate * 100.0
        );
        println!("Avg Latency:    {:.2} ms", self.avg_latency_ms);
        println!("Min Latency:    {:.2} ms", self.min_latency_ms);
        println!("Max Latency:    {:.2} ms", self.max_latency_ms);
        println!("P50 Latency:    {:.2} ms", self.p50_latency_ms);
        println!("P90 Latency:    {:.2} ms", self.p90_latency_ms);
        println!("P95 Latency:    {:.2} ms", self.p95_latency_ms);
        println!("P99 Latency:    {:.2} ms", self.p99_latency_ms);

        println!("\nStatus Codes:");
        let mut codes: Vec<_> = self.status_codes.iter().collect();
        codes.sort_by_key(|a| a.0);
        for (code, count) in codes {
            println!("  {}: {}", code, count);
        }

        println!("\nData Received: {:.2} MB", self.data_received as f64 / 1_048_576.0);

        if !self.grouped_requests.is_empty() {
            println!("\nGrouped Requests:");
            let mut groups: Vec<_> = self.grouped_requests.iter().collect();
            groups.sort_by_key(|a| a.0);
            for (name, stats) in groups {
                println!("  Request: {}", name);
                println!("    Count: {}", stats.total_requests);
                println!("    P95:   {:.2} ms", stats.p95_latency_ms);
                if stats.failed_requests > 0 {
                    println!("    Failed: {}", stats.failed_requests);
                }
            }
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            let mut errors: Vec<_> = self.errors.iter().collect();
            errors.sort_by(|a, b| b.1.cmp(a.1));
            for (err, count) in errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.checks.is_empty() {
            println!(
                "\nChecks: {:.2}% ({} passed, {} failed)",
                self.check_pass_rate * 100.0,
                self.checks_passed,
                self.checks_failed
            );
            let mut checks: Vec<_> = self.checks.iter().collect();
            checks.sort_by_key(|a| a.0);
            for (name, (total, passes)) in checks {
                let fail = total - passes;
                let percent = (*passes as f64 / *total as f64) * 100.0;
                if fail > 0 {
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name, percent, passes, fail
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, passes);
                }
            }
        }

        println!("--------------------\n");
    }
}
