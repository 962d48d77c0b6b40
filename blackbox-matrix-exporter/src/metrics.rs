//! Process-level self-monitoring metrics, served on `/metrics`.
//!
//! Unlike the per-request probe metrics these live for the whole process. All
//! values are atomics, so handlers update them without locking.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::executor::ProbeResultSet;

/// Outcome of a `/probe` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    /// The matrix was executed.
    Ok,
    /// No `matrix` parameter.
    MissingMatrix,
    /// The `matrix` parameter names no configured matrix.
    UnknownMatrix,
}

impl RequestResult {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MissingMatrix => "missing_matrix",
            Self::UnknownMatrix => "unknown_matrix",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProbeLabels {
    matrix: String,
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct MatrixLabels {
    matrix: String,
}

fn duration_histogram() -> Histogram {
    // 5ms .. ~10s
    Histogram::new(exponential_buckets(0.005, 2.0, 12))
}

/// Exporter self-monitoring metrics.
#[derive(Debug)]
pub struct ExporterMetrics {
    registry: Registry,
    requests: Family<RequestLabels, Counter>,
    probes: Family<ProbeLabels, Counter>,
    durations: Family<MatrixLabels, Histogram>,
}

impl ExporterMetrics {
    /// Create the metrics for a registry holding `matrix_count` matrixes.
    pub fn new(matrix_count: usize) -> Self {
        let mut registry = Registry::with_prefix("blackbox_matrix");

        let requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "probe_requests",
            "Probe requests received, by result",
            requests.clone(),
        );

        let probes = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "probes",
            "Individual target probes, by matrix and result",
            probes.clone(),
        );

        let durations = Family::<MatrixLabels, Histogram>::new_with_constructor(
            duration_histogram as fn() -> Histogram,
        );
        registry.register(
            "matrix_duration_seconds",
            "Wall-clock duration of matrix executions",
            durations.clone(),
        );

        let matrixes: Gauge = Gauge::default();
        matrixes.set(i64::try_from(matrix_count).unwrap_or(i64::MAX));
        registry.register(
            "configured_matrixes",
            "Number of matrixes loaded from the configuration",
            matrixes,
        );

        Self {
            registry,
            requests,
            probes,
            durations,
        }
    }

    /// Count a `/probe` request.
    pub fn record_request(&self, result: RequestResult) {
        self.requests
            .get_or_create(&RequestLabels {
                result: result.as_str().to_string(),
            })
            .inc();
    }

    /// Count the target outcomes of a matrix execution.
    pub fn record_execution(&self, result: &ProbeResultSet) {
        let failed = result.failed() as u64;
        let succeeded = result.outcomes.len() as u64 - failed;

        for (label, count) in [("success", succeeded), ("failure", failed)] {
            if count > 0 {
                self.probes
                    .get_or_create(&ProbeLabels {
                        matrix: result.matrix.clone(),
                        result: label.to_string(),
                    })
                    .inc_by(count);
            }
        }

        self.durations
            .get_or_create(&MatrixLabels {
                matrix: result.matrix.clone(),
            })
            .observe(result.duration_seconds);
    }

    /// Render in the OpenMetrics text format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry)?;
        Ok(body)
    }
}
