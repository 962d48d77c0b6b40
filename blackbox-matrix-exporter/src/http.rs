//! HTTP server: the `/probe` request handler and the self-monitoring endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::executor;
use crate::exposition;
use crate::metrics::{ExporterMetrics, RequestResult};
use crate::registry::SharedRegistry;

/// Header carrying the scrape timeout Prometheus applies to the request.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// How long a single matrix execution may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBudget {
    /// Upper bound for every execution.
    pub probe_timeout: Duration,
    /// Safety margin subtracted from the announced scrape timeout.
    pub scrape_timeout_offset: Duration,
}

impl ProbeBudget {
    /// Budget for a request, given its headers.
    ///
    /// The configured probe timeout applies unless Prometheus announces a
    /// shorter scrape timeout. An offset larger than the scrape timeout itself
    /// is ignored.
    pub fn for_request(&self, headers: &HeaderMap) -> Duration {
        let scrape_timeout = headers
            .get(SCRAPE_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|d| !d.is_zero());

        match scrape_timeout {
            Some(scrape) => {
                let scrape = if scrape > self.scrape_timeout_offset {
                    scrape - self.scrape_timeout_offset
                } else {
                    scrape
                };
                scrape.min(self.probe_timeout)
            }
            None => self.probe_timeout,
        }
    }
}

impl From<&ServerConfig> for ProbeBudget {
    fn from(config: &ServerConfig) -> Self {
        Self {
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            scrape_timeout_offset: Duration::from_millis(config.scrape_timeout_offset_ms),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
    metrics: Arc<ExporterMetrics>,
    budget: ProbeBudget,
}

#[derive(Debug, Deserialize)]
struct ProbeParams {
    matrix: Option<String>,
}

/// Create the HTTP router.
pub fn create_router(
    registry: SharedRegistry,
    metrics: Arc<ExporterMetrics>,
    budget: ProbeBudget,
) -> Router {
    let state = AppState {
        registry,
        metrics,
        budget,
    };

    Router::new()
        .route("/probe", get(probe_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the /probe endpoint.
async fn probe_handler(
    State(state): State<AppState>,
    Query(params): Query<ProbeParams>,
    headers: HeaderMap,
) -> Response {
    let Some(name) = params.matrix.filter(|m| !m.is_empty()) else {
        state.metrics.record_request(RequestResult::MissingMatrix);
        return (StatusCode::BAD_REQUEST, "No matrix configuration given\n").into_response();
    };

    let Some(matrix) = state.registry.lookup(&name) else {
        debug!(matrix = %name, "Probe request for unknown matrix");
        state.metrics.record_request(RequestResult::UnknownMatrix);
        return (StatusCode::BAD_REQUEST, "Matrix Configuration not found\n").into_response();
    };

    state.metrics.record_request(RequestResult::Ok);

    let budget = state.budget.for_request(&headers);
    let result = executor::execute(matrix, budget).await;
    state.metrics.record_execution(&result);

    if !result.success() {
        for outcome in result.outcomes.iter().filter(|o| !o.success) {
            warn!(
                matrix = %result.matrix,
                instance = %outcome.target,
                reason = outcome.failure_reason.as_deref().unwrap_or_default(),
                "Probe failed"
            );
        }
    }

    match exposition::render(result) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", exposition::CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(matrix = %name, error = %e, "Failed to encode probe metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n").into_response()
        }
    }
}

/// Handler for the /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", exposition::CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode exporter metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n").into_response()
        }
    }
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    registry: SharedRegistry,
    metrics: Arc<ExporterMetrics>,
    budget: ProbeBudget,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        registry: SharedRegistry,
        metrics: Arc<ExporterMetrics>,
        budget: ProbeBudget,
        listen_addr: SocketAddr,
    ) -> Self {
        Self {
            registry,
            metrics,
            budget,
            listen_addr,
        }
    }

    /// Bind the listen address and serve until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.listen_addr, "Starting HTTP server");

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let router = create_router(self.registry, self.metrics, self.budget);

        info!(addr = %addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExporterConfig, MatrixSpec};
    use crate::prober::{ModuleOptions, ProbeOutcome, Prober, ProberSet};
    use crate::registry::TargetRegistry;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;
    use tower::ServiceExt;

    /// Stands in for the http module: every target succeeds after 50ms.
    struct FakeHttpProber {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Prober for FakeHttpProber {
        fn name(&self) -> &str {
            "http"
        }

        fn options(&self, _spec: &MatrixSpec) -> Result<ModuleOptions, String> {
            Ok(ModuleOptions::None)
        }

        async fn probe(
            &self,
            target: &str,
            _options: &ModuleOptions,
            _deadline: Instant,
        ) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_millis(50);
            tokio::time::sleep(delay).await;
            ProbeOutcome::success(target, delay)
        }
    }

    struct Fixture {
        router: Router,
        calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let config = ExporterConfig::parse(
            r#"
matrixes:
  web:
    prober: http
    instances: ["https://example.com"]
"#,
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut probers = ProberSet::new();
        probers.register(Arc::new(FakeHttpProber {
            calls: calls.clone(),
        }));

        let registry = Arc::new(TargetRegistry::from_config(&config, &probers).unwrap());
        let metrics = Arc::new(ExporterMetrics::new(registry.len()));
        let router = create_router(registry, metrics, ProbeBudget::from(&config.server));

        Fixture { router, calls }
    }

    async fn request(router: &Router, uri: &str) -> (StatusCode, String, Option<String>) {
        let response = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        (status, String::from_utf8(body.to_vec()).unwrap(), content_type)
    }

    fn value(body: &str, series: &str) -> Option<f64> {
        body.lines()
            .find_map(|line| line.strip_prefix(series)?.strip_prefix(' '))
            .and_then(|v| v.trim().parse().ok())
    }

    #[tokio::test]
    async fn test_probe_known_matrix() {
        let fixture = fixture();

        let (status, body, content_type) = request(&fixture.router, "/probe?matrix=web").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("application/openmetrics-text"));
        assert_eq!(value(&body, "probe_success"), Some(1.0));

        let duration = value(&body, "probe_duration_seconds").unwrap();
        assert!((0.045..0.5).contains(&duration), "duration {}", duration);
        assert_eq!(
            value(&body, "probe_target_success{target=\"https://example.com\"}"),
            Some(1.0)
        );
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_missing_matrix() {
        let fixture = fixture();

        for uri in ["/probe", "/probe?matrix=", "/probe?other=web"] {
            let (status, body, _) = request(&fixture.router, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body, "No matrix configuration given\n");
        }
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_unknown_matrix() {
        let fixture = fixture();

        let (status, body, _) = request(&fixture.router, "/probe?matrix=nope").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Matrix Configuration not found\n");
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_counts_requests() {
        let fixture = fixture();

        request(&fixture.router, "/probe?matrix=web").await;
        request(&fixture.router, "/probe?matrix=nope").await;
        request(&fixture.router, "/probe").await;

        let (status, body, _) = request(&fixture.router, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value(&body, "blackbox_matrix_probe_requests_total{result=\"ok\"}"),
            Some(1.0)
        );
        assert_eq!(
            value(
                &body,
                "blackbox_matrix_probe_requests_total{result=\"unknown_matrix\"}"
            ),
            Some(1.0)
        );
        assert_eq!(
            value(
                &body,
                "blackbox_matrix_probe_requests_total{result=\"missing_matrix\"}"
            ),
            Some(1.0)
        );
        assert_eq!(
            value(
                &body,
                "blackbox_matrix_probes_total{matrix=\"web\",result=\"success\"}"
            ),
            Some(1.0)
        );
        assert_eq!(value(&body, "blackbox_matrix_configured_matrixes"), Some(1.0));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let fixture = fixture();
        let (status, body, _) = request(&fixture.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "healthy\n");
    }

    fn budget() -> ProbeBudget {
        ProbeBudget {
            probe_timeout: Duration::from_millis(9_500),
            scrape_timeout_offset: Duration::from_millis(500),
        }
    }

    fn headers(scrape_timeout: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SCRAPE_TIMEOUT_HEADER,
            HeaderValue::from_str(scrape_timeout).unwrap(),
        );
        headers
    }

    #[test]
    fn test_budget_without_header() {
        assert_eq!(
            budget().for_request(&HeaderMap::new()),
            Duration::from_millis(9_500)
        );
    }

    #[test]
    fn test_budget_from_scrape_timeout() {
        assert_eq!(
            budget().for_request(&headers("5")),
            Duration::from_millis(4_500)
        );
        // A longer scrape timeout does not extend the configured bound.
        assert_eq!(
            budget().for_request(&headers("30")),
            Duration::from_millis(9_500)
        );
        // Offset larger than the scrape timeout is ignored.
        assert_eq!(
            budget().for_request(&headers("0.25")),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_budget_ignores_invalid_header() {
        for value in ["abc", "-1", "0", ""] {
            assert_eq!(
                budget().for_request(&headers(value)),
                Duration::from_millis(9_500),
                "{:?}",
                value
            );
        }
    }
}
