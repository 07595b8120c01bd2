use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::check::Check;
use crate::engine::executor::RequestSpec;
use crate::engine::scenario::{Iteration, RunOptions, Scenario};
use crate::engine::schedule::StageScheduler;
use crate::stats::thresholds::Threshold;
use crate::utils::{parse_duration_or, parse_duration_str};

/// Errors raised while turning a scenario file into a runnable [`Scenario`].
/// Any of these stops the test before a single virtual user starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no stages configured")]
    EmptySchedule,

    #[error("stage {index}: {source}")]
    Stage {
        index: usize,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("negative duration: {0}")]
    NegativeDuration(String),

    #[error("negative target: {0}")]
    NegativeTarget(i64),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("scenario has no requests")]
    NoRequests,

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("invalid header '{name}'")]
    InvalidHeader { name: String },

    #[error("invalid threshold '{expr}' for {metric}: {reason}")]
    InvalidThreshold {
        metric: String,
        expr: String,
        reason: String,
    },

    #[error("failed to read scenario file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ScheduleStep {
    /// Length of the ramp segment (e.g., "30s", "3m")
    pub duration: String,
    /// Concurrency reached at the end of the segment
    pub target: i64,
}

/// A named assertion evaluated against one response of the batch.
/// When `name` is omitted a name of the form `request {index} ...` is generated.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckConfig {
    /// Status code equals `equals`
    Status {
        equals: u16,
        name: Option<String>,
    },
    /// Status code is 2xx
    Success { name: Option<String> },
    /// Response body contains `text`
    BodyContains { text: String, name: Option<String> },
    /// Response carries `header`
    HeaderPresent { header: String, name: Option<String> },
    /// Response latency is below `max` (e.g., "500ms")
    LatencyBelow { max: String, name: Option<String> },
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct RequestConfig {
    /// HTTP method (default: GET)
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// Metric name for this request (default: the URL)
    pub name: Option<String>,
    /// Per-request timeout overriding the scenario-wide one
    pub timeout: Option<String>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Ramping schedule (k6: stages)
    #[serde(alias = "schedule")]
    pub stages: Vec<ScheduleStep>,
    /// Concurrency at t=0 (k6: startVUs)
    #[serde(alias = "startVUs")]
    pub start_target: Option<i64>,
    /// Requests issued concurrently on every iteration (k6: http.batch)
    pub requests: Vec<RequestConfig>,
    /// Default request timeout (default: 30s)
    pub timeout: Option<String>,
    /// Minimum time per iteration; faster iterations sleep for the remainder
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
    /// Graceful shutdown wait time (default: 30s)
    #[serde(alias = "gracefulStop")]
    pub stop: Option<String>,
    /// Interval between scheduler ticks (default: 1s)
    pub tick: Option<String>,
    /// Read and discard response bodies instead of keeping them for checks
    #[serde(alias = "responseSink")]
    pub response_sink: Option<bool>,
    /// Pass/Fail criteria (k6: thresholds)
    #[serde(alias = "criteria")]
    pub thresholds: Option<HashMap<String, Vec<String>>>,
}

impl Config {
    /// Load a scenario file. `.json` files are parsed as JSON, everything else as YAML.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })
    }

    /// Validate every field and build the runnable scenario.
    pub fn into_scenario(self) -> Result<Scenario, ConfigError> {
        let schedule = StageScheduler::from_steps(self.start_target.unwrap_or(0), &self.stages)?;

        if self.requests.is_empty() {
            return Err(ConfigError::NoRequests);
        }
        let mut iteration = Iteration::new();
        for (index, request) in self.requests.iter().enumerate() {
            let spec = request.to_spec()?;
            let checks = request
                .checks
                .iter()
                .map(|c| c.to_check(index))
                .collect::<Result<Vec<_>, _>>()?;
            iteration.push(spec, checks);
        }

        let defaults = RunOptions::default();
        let options = RunOptions {
            request_timeout: parse_duration_or(self.timeout.as_deref(), defaults.request_timeout)?,
            min_iteration_duration: self
                .min_iteration_duration
                .as_deref()
                .map(parse_duration_str)
                .transpose()?
                .filter(|d| !d.is_zero()),
            graceful_stop: parse_duration_or(self.stop.as_deref(), defaults.graceful_stop)?,
            tick: parse_duration_or(self.tick.as_deref(), defaults.tick)?,
            response_sink: self.response_sink.unwrap_or(false),
        };
        if options.tick.is_zero() {
            return Err(ConfigError::InvalidDuration("tick must be greater than zero".into()));
        }

        let mut thresholds = Vec::new();
        if let Some(criteria) = &self.thresholds {
            let mut metrics: Vec<_> = criteria.iter().collect();
            metrics.sort_by_key(|(name, _)| name.as_str());
            for (metric, exprs) in metrics {
                for expr in exprs {
                    thresholds.push(Threshold::parse(metric, expr)?);
                }
            }
        }

        Ok(Scenario {
            schedule,
            iteration,
            options,
            thresholds,
        })
    }
}

impl RequestConfig {
    fn to_spec(&self) -> Result<RequestSpec, ConfigError> {
        let mut spec = RequestSpec::parse(&self.method, &self.url)?;
        for (name, value) in &self.headers {
            spec = spec.with_header(name, value)?;
        }
        if let Some(body) = &self.body {
            spec = spec.with_body(body.clone());
        }
        if let Some(name) = &self.name {
            spec = spec.with_name(name.clone());
        }
        if let Some(timeout) = &self.timeout {
            spec = spec.with_timeout(parse_duration_str(timeout)?);
        }
        Ok(spec)
    }
}

impl CheckConfig {
    fn to_check(&self, index: usize) -> Result<Check, ConfigError> {
        let named = |name: &Option<String>, fallback: String| name.clone().unwrap_or(fallback);
        let check = match self {
            CheckConfig::Status { equals, name } => Check::status_is(
                named(name, format!("request {} status is {}", index, equals)),
                *equals,
            ),
            CheckConfig::Success { name } => {
                Check::is_success(named(name, format!("request {} status is 2xx", index)))
            }
            CheckConfig::BodyContains { text, name } => Check::body_contains(
                named(name, format!("request {} body contains '{}'", index, text)),
                text.clone(),
            ),
            CheckConfig::HeaderPresent { header, name } => Check::has_header(
                named(name, format!("request {} has header {}", index, header)),
                header.clone(),
            ),
            CheckConfig::LatencyBelow { max, name } => {
                let bound: Duration = parse_duration_str(max)?;
                Check::latency_below(
                    named(name, format!("request {} latency below {}", index, max)),
                    bound,
                )
            }
        };
        Ok(check)
    }
}
