//! Blackbox-style Prometheus exporter probing named matrixes of targets.
//!
//! A matrix is a named group of targets sharing one probe module (`dns`, `http`
//! or `tcp`). Every scrape of `/probe?matrix=<name>` probes all targets of the
//! matrix concurrently under one deadline and answers with a freshly built set
//! of metrics for that execution only.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ HTTP /probe  │──>│ TargetRegistry │──>│   executor   │──>│  exposition  │
//! │  (handler)   │   │  (read-only)   │   │ (task/target)│   │ (per request)│
//! └──────────────┘   └────────────────┘   └──────┬───────┘   └──────────────┘
//!                                                │
//!                                         ┌──────┴───────┐
//!                                         │ Prober (dns, │
//!                                         │  http, tcp)  │
//!                                         └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! blackbox-matrix-exporter --config blackbox-matrix.yaml
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod executor;
pub mod exposition;
pub mod http;
pub mod metrics;
pub mod prober;
pub mod registry;

pub use config::{ConfigError, ExporterConfig, LogFormat, LoggingConfig};
pub use executor::{ProbeResultSet, execute};
pub use http::{HttpServer, ProbeBudget};
pub use metrics::ExporterMetrics;
pub use prober::{ProbeOutcome, Prober, ProberSet};
pub use registry::{Matrix, SharedRegistry, TargetRegistry};

/// Initialize tracing/logging.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}
