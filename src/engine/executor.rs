use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;
use url::Url;

use crate::cli::config::ConfigError;
use crate::stats::MetricsAggregator;

/// Why a request did not produce a successful response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("request timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unexpected status {0}")]
    Status(u16),
}

impl RequestFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestFailure::Timeout(_) => "timeout",
            RequestFailure::Connection(_) => "connection",
            RequestFailure::InvalidRequest(_) => "invalid_request",
            RequestFailure::Status(_) => "status",
        }
    }
}

/// One request of an iteration's batch. Immutable once the scenario is built.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub name: Option<String>,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            name: None,
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Validate `url` as an absolute http(s) URL and `method` as an HTTP method.
    pub fn parse(method: &str, url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason,
        };
        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
        }
        let uri: Uri = parsed
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidMethod(method.to_string()))?;
        Ok(Self::new(method, uri))
    }

    pub fn get(url: &str) -> Result<Self, ConfigError> {
        Self::parse("GET", url)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidHeader {
            name: name.to_string(),
        };
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        self.headers.append(header, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Name used to group this request in metrics (the URL unless named).
    pub fn metric_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.uri.to_string())
    }
}

/// What a transport hands back for a request that got an HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Bytes read off the wire for the body; differs from `body.len()` when the
    /// body was discarded.
    pub body_size: usize,
}

/// Seam between the executor and the network.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a RequestSpec,
    ) -> BoxFuture<'a, Result<TransportResponse, RequestFailure>>;
}

#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status, or [`Response::FAILED_STATUS`] when no response arrived
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub body_size: usize,
    pub latency: Duration,
    pub failure: Option<RequestFailure>,
}

impl Response {
    pub const FAILED_STATUS: u16 = 0;

    fn from_transport(raw: TransportResponse, latency: Duration) -> Self {
        let status = raw.status.as_u16();
        let failure = (!raw.status.is_success()).then_some(RequestFailure::Status(status));
        Self {
            status,
            headers: raw.headers,
            body: raw.body,
            body_size: raw.body_size,
            latency,
            failure,
        }
    }

    fn failed(failure: RequestFailure, latency: Duration) -> Self {
        Self {
            status: Self::FAILED_STATUS,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            body_size: 0,
            latency,
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Issues an iteration's requests as one concurrent batch.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsAggregator>,
    default_timeout: Duration,
}

impl RequestExecutor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsAggregator>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            metrics,
            default_timeout,
        }
    }

    /// Send every request concurrently and wait for all of them.
    /// `responses[i]` always belongs to `requests[i]`.
    pub async fn execute(&self, vu_id: u64, requests: &[RequestSpec]) -> Vec<Response> {
        join_all(requests.iter().map(|spec| self.issue(vu_id, spec))).await
    }

    async fn issue(&self, vu_id: u64, spec: &RequestSpec) -> Response {
        let limit = spec.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        let response = match tokio::time::timeout(limit, self.transport.send(spec)).await {
            Ok(Ok(raw)) => Response::from_transport(raw, start.elapsed()),
            Ok(Err(failure)) => Response::failed(failure, start.elapsed()),
            Err(_) => Response::failed(RequestFailure::Timeout(limit), start.elapsed()),
        };

        if let Err(e) = self
            .metrics
            .record_request(vu_id, &spec.metric_name(), &response)
        {
            trace!(vu = vu_id, error = %e, "request sample dropped");
        }
        response
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory transport: answers after a per-path delay with a fixed status
    /// and the request path as body.
    pub struct MockTransport {
        pub status: StatusCode,
        pub default_latency: Duration,
        pub latencies: HashMap<String, Duration>,
        pub refuse: Vec<String>,
        pub calls: AtomicUsize,
    }

    impl MockTransport {
        pub fn new(status: StatusCode, default_latency: Duration) -> Self {
            Self {
                status,
                default_latency,
                latencies: HashMap::new(),
                refuse: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_latency(mut self, path: &str, latency: Duration) -> Self {
            self.latencies.insert(path.to_string(), latency);
            self
        }

        pub fn refusing(mut self, path: &str) -> Self {
            self.refuse.push(path.to_string());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn send<'a>(
            &'a self,
            request: &'a RequestSpec,
        ) -> BoxFuture<'a, Result<TransportResponse, RequestFailure>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let path = request.uri.path().to_string();
                let latency = self
                    .latencies
                    .get(&path)
                    .copied()
                    .unwrap_or(self.default_latency);
                tokio::time::sleep(latency).await;
                if self.refuse.contains(&path) {
                    return Err(RequestFailure::Connection("connection refused".into()));
                }
                let body = Bytes::from(path);
                Ok(TransportResponse {
                    status: self.status,
                    headers: HeaderMap::new(),
                    body_size: body.len(),
                    body,
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    fn executor(transport: MockTransport) -> (RequestExecutor, Arc<MetricsAggregator>) {
        let metrics = Arc::new(MetricsAggregator::new(4));
        let executor = RequestExecutor::new(
            Arc::new(transport),
            metrics.clone(),
            RequestExecutor::DEFAULT_TIMEOUT,
        );
        (executor, metrics)
    }

    fn batch(paths: &[&str]) -> Vec<RequestSpec> {
        paths
            .iter()
            .map(|p| RequestSpec::get(&format!("http://target.test{}", p)).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_keep_submission_order() {
        let transport = MockTransport::new(StatusCode::OK, Duration::from_millis(10))
            .with_latency("/slow", Duration::from_millis(300))
            .with_latency("/medium", Duration::from_millis(200))
            .with_latency("/fast", Duration::from_millis(100));
        let (executor, _) = executor(transport);

        let orders: [&[&str]; 3] = [
            &["/slow", "/medium", "/fast"],
            &["/fast", "/slow", "/medium"],
            &["/medium", "/fast", "/slow", "/other"],
        ];
        for order in orders {
            let responses = executor.execute(1, &batch(order)).await;
            let bodies: Vec<_> = responses.iter().map(|r| r.text().into_owned()).collect();
            assert_eq!(bodies, order);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_runs_concurrently() {
        let transport = MockTransport::new(StatusCode::OK, Duration::from_millis(500));
        let (executor, _) = executor(transport);

        let start = Instant::now();
        let responses = executor.execute(1, &batch(&["/a", "/b"])).await;
        assert_eq!(responses.len(), 2);
        assert!(start.elapsed() < Duration::from_millis(600));
        assert!(responses.iter().all(|r| r.latency >= Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_sentinel_without_failing_siblings() {
        let transport = MockTransport::new(StatusCode::OK, Duration::from_millis(10))
            .with_latency("/hang", Duration::from_secs(120));
        let (executor, metrics) = executor(transport);

        let mut requests = batch(&["/hang", "/ok"]);
        requests[0] = requests[0].clone().with_timeout(Duration::from_secs(1));
        let responses = executor.execute(7, &requests).await;

        assert_eq!(responses[0].status, Response::FAILED_STATUS);
        assert_eq!(
            responses[0].failure,
            Some(RequestFailure::Timeout(Duration::from_secs(1)))
        );
        assert_eq!(responses[1].status, 200);
        assert!(responses[1].is_success());

        let report = metrics.finalize();
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_request_falls_back_to_default_timeout() {
        let transport = MockTransport::new(StatusCode::OK, Duration::from_millis(10))
            .with_latency("/hang", Duration::from_secs(120));
        let (executor, metrics) = executor(transport);

        let start = Instant::now();
        let responses = executor.execute(3, &batch(&["/hang", "/ok"])).await;

        assert!(start.elapsed() < Duration::from_secs(31));
        assert_eq!(responses[0].status, Response::FAILED_STATUS);
        assert_eq!(
            responses[0].failure,
            Some(RequestFailure::Timeout(RequestExecutor::DEFAULT_TIMEOUT))
        );
        assert!(responses[1].is_success());
        assert_eq!(metrics.finalize().errors.get("request timeout after 30s"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_and_error_status() {
        let transport = MockTransport::new(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO)
            .refusing("/down");
        let (executor, metrics) = executor(transport);

        let responses = executor.execute(1, &batch(&["/down", "/up"])).await;
        assert_eq!(responses[0].status, 0);
        assert_eq!(responses[0].failure.as_ref().map(|f| f.kind()), Some("connection"));
        assert_eq!(responses[1].status, 500);
        assert_eq!(responses[1].failure, Some(RequestFailure::Status(500)));

        let report = metrics.finalize();
        assert_eq!(report.failed_requests, 2);
        assert_eq!(report.status_codes.get(&500), Some(&1));
        assert_eq!(report.status_codes.get(&0), Some(&1));
    }

    #[test]
    fn test_request_spec_parse() {
        let spec = RequestSpec::parse("post", "https://example.com/a?b=c")
            .unwrap()
            .with_header("x-test", "1")
            .unwrap()
            .with_body("payload");
        assert_eq!(spec.method, Method::POST);
        assert_eq!(spec.uri.path(), "/a");
        assert_eq!(spec.metric_name(), "https://example.com/a?b=c");
        assert_eq!(spec.body.as_deref(), Some(&b"payload"[..]));

        assert!(matches!(
            RequestSpec::get("ftp://example.com/"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            RequestSpec::parse("GE T", "http://example.com/"),
            Err(ConfigError::InvalidMethod(_))
        ));
        assert!(matches!(
            RequestSpec::get("http://example.com/").unwrap().with_header("bad header", "v"),
            Err(ConfigError::InvalidHeader { .. })
        ));
    }
}
