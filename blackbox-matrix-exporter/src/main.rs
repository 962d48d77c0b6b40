//! Blackbox matrix exporter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use blackbox_matrix_exporter::{
    ExporterConfig, ExporterMetrics, HttpServer, LoggingConfig, ProbeBudget, ProberSet,
    TargetRegistry, init_tracing,
};

/// Blackbox-style exporter probing named matrixes of targets.
#[derive(Parser, Debug)]
#[command(name = "blackbox-matrix-exporter")]
#[command(about = "Probe named matrixes of targets and expose the results to Prometheus")]
#[command(version)]
struct Args {
    /// Path to configuration file (YAML format).
    #[arg(short, long, default_value = "blackbox-matrix.yaml")]
    config: String,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match ExporterConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            let mut logging = LoggingConfig::default();
            if let Some(level) = &args.log_level {
                logging.level = level.clone();
            }
            init_tracing(&logging)?;
            error!(config = %args.config, error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;

    let probers = ProberSet::builtin();
    let registry = match TargetRegistry::from_config(&config, &probers) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(config = %args.config, error = %e, "Invalid matrix configuration");
            return Err(e.into());
        }
    };

    let listen_addr: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    info!(
        config = %args.config,
        matrixes = registry.len(),
        probers = ?probers.names(),
        listen = %listen_addr,
        "Starting blackbox matrix exporter"
    );
    if registry.is_empty() {
        warn!("No matrixes configured, every probe request will be rejected");
    }

    let metrics = Arc::new(ExporterMetrics::new(registry.len()));
    let budget = ProbeBudget::from(&config.server);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind before waiting on signals so a bind failure is fatal.
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen_addr, e))?;

    let http_server = HttpServer::new(registry, metrics, budget, listen_addr);
    let mut http_task = tokio::spawn(http_server.serve(listener, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        joined = &mut http_task => {
            return match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "HTTP server error");
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
    }

    shutdown_tx.send(true)?;

    match tokio::time::timeout(Duration::from_secs(5), http_task).await {
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
        Err(_) => warn!("HTTP server did not stop in time"),
        _ => {}
    }

    info!("Exporter stopped");
    Ok(())
}

/// Resolves on SIGTERM; never on platforms without it.
async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
