use std::time::Duration;

use futures::future::BoxFuture;
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::engine::executor::{RequestFailure, RequestSpec, Transport, TransportResponse};

/// Pooled HTTP/1.1 + HTTP/2 client shared by every virtual user.
/// Connections are reused across iterations; request state is per call.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    response_sink: bool,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_pool_size(2000)
    }

    /// Create a new HttpClient with a custom connection pool size
    /// pool_size: Maximum idle connections per host (default: 2000)
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self::with_pool_and_workers(pool_size, 1000)
    }

    /// Create a new HttpClient with pool size and user-scaled HTTP/2 windows
    /// At high user counts (>5K), use smaller windows to reduce memory
    pub fn with_pool_and_workers(pool_size: usize, total_users: usize) -> Self {
        // Several crypto providers may be linked; pin ring once per process.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let (conn_window, stream_window) = if total_users > 5000 {
            (128 * 1024, 64 * 1024)
        } else if total_users > 2000 {
            (256 * 1024, 128 * 1024)
        } else {
            (512 * 1024, 256 * 1024)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .http2_initial_connection_window_size(conn_window)
            .http2_initial_stream_window_size(stream_window)
            .build(https);

        Self {
            client,
            response_sink: false,
        }
    }

    /// When enabled the body is still read to the end (required for keep-alive)
    /// but dropped chunk by chunk; only its size is kept.
    pub fn with_response_sink(mut self, enabled: bool) -> Self {
        self.response_sink = enabled;
        self
    }

    /// Pool size used for a run peaking at `total_users`: about one idle
    /// connection per five users, clamped to 500..=2000.
    pub fn pool_size_for(total_users: usize) -> usize {
        (total_users / 5).clamp(500, 2000)
    }

    // Must be called inside a Tokio Runtime
    pub async fn request(&self, spec: &RequestSpec) -> Result<TransportResponse, RequestFailure> {
        let mut builder = Request::builder()
            .method(spec.method.clone())
            .uri(spec.uri.clone());
        for (k, v) in &spec.headers {
            builder = builder.header(k, v);
        }
        let body = spec.body.clone().unwrap_or_default();
        let req = builder
            .body(Full::new(body))
            .map_err(|e| RequestFailure::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| RequestFailure::Connection(e.to_string()))?;
        let (parts, mut body_stream) = response.into_parts();

        let (body, body_size) = if self.response_sink {
            let mut total_size = 0usize;
            while let Some(frame) = body_stream.frame().await {
                let frame = frame.map_err(|e| RequestFailure::Connection(e.to_string()))?;
                if let Some(data) = frame.data_ref() {
                    total_size += data.len();
                }
            }
            (Bytes::new(), total_size)
        } else {
            let body = body_stream
                .collect()
                .await
                .map_err(|e| RequestFailure::Connection(e.to_string()))?
                .to_bytes();
            let size = body.len();
            (body, size)
        };

        Ok(TransportResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            body_size,
        })
    }
}

impl Transport for HttpClient {
    fn send<'a>(
        &'a self,
        request: &'a RequestSpec,
    ) -> BoxFuture<'a, Result<TransportResponse, RequestFailure>> {
        Box::pin(self.request(request))
    }
}
