//! TCP connect probe module.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::{ModuleOptions, ProbeOutcome, Prober, reason, reject_foreign_sections, split_host_port};
use crate::config::MatrixSpec;

/// TCP probe module: succeeds when a connection to `host:port` is established.
/// The connection is closed immediately.
#[derive(Debug, Clone, Default)]
pub struct TcpProber;

impl TcpProber {
    /// Create the module.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for TcpProber {
    fn name(&self) -> &str {
        "tcp"
    }

    fn options(&self, spec: &MatrixSpec) -> Result<ModuleOptions, String> {
        reject_foreign_sections(spec, "tcp")?;
        Ok(ModuleOptions::None)
    }

    fn validate_target(&self, target: &str) -> Result<(), String> {
        match split_host_port(target)? {
            (host, Some(_)) if !host.is_empty() => Ok(()),
            _ => Err(format!("expected host:port, got '{}'", target)),
        }
    }

    async fn probe(
        &self,
        target: &str,
        _options: &ModuleOptions,
        deadline: Instant,
    ) -> ProbeOutcome {
        let start = Instant::now();

        match tokio::time::timeout_at(deadline, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => {
                debug!(instance = %target, "TCP probe succeeded");
                ProbeOutcome::success(target, start.elapsed())
            }
            Ok(Err(e)) => {
                debug!(instance = %target, error = %e, "TCP probe failed");
                ProbeOutcome::failure(target, start.elapsed(), "connection_failed")
            }
            Err(_) => {
                debug!(instance = %target, "TCP probe timed out");
                ProbeOutcome::failure(target, start.elapsed(), reason::TIMEOUT)
            }
        }
    }
}
