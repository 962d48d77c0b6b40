//! Probe modules.
//!
//! A probe module performs one probe against one target before a deadline. Each
//! module owns a single prober name (`dns`, `http`, `tcp`), validates the
//! matrix sections that belong to it and reports every expected failure as a
//! [`ProbeOutcome`] carrying a short failure reason instead of an error.

pub mod dns;
pub mod http;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::MatrixSpec;

pub use dns::{DnsOptions, DnsProber};
pub use http::{HttpOptions, HttpProber};
pub use tcp::TcpProber;

/// Failure reasons shared by every module.
pub mod reason {
    /// The module gave up at its per-target deadline.
    pub const TIMEOUT: &str = "timeout";
    /// The overall matrix deadline passed while the probe was still in flight.
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
    /// The probe task panicked.
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Module-specific options, resolved once when the target registry is built.
#[derive(Debug, Clone, Default)]
pub enum ModuleOptions {
    /// The module takes no options.
    #[default]
    None,
    Dns(DnsOptions),
    Http(HttpOptions),
}

/// Result of probing one target.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    /// The probed target, as configured.
    pub target: String,
    /// Whether the probe succeeded.
    pub success: bool,
    /// Time spent probing the target.
    pub duration_seconds: f64,
    /// Short machine-readable reason, set when `success` is false.
    pub failure_reason: Option<String>,
}

impl ProbeOutcome {
    /// A successful outcome.
    pub fn success(target: impl Into<String>, duration: Duration) -> Self {
        Self {
            target: target.into(),
            success: true,
            duration_seconds: duration.as_secs_f64(),
            failure_reason: None,
        }
    }

    /// A failed outcome.
    pub fn failure(
        target: impl Into<String>,
        duration: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            success: false,
            duration_seconds: duration.as_secs_f64(),
            failure_reason: Some(reason.into()),
        }
    }
}

/// A protocol-specific probe module.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Prober name used in the `prober` field of a matrix.
    fn name(&self) -> &str;

    /// Build the typed options for a matrix, rejecting sections that do not
    /// apply to this module.
    fn options(&self, spec: &MatrixSpec) -> Result<ModuleOptions, String>;

    /// Check the syntax of one target.
    fn validate_target(&self, target: &str) -> Result<(), String> {
        if target.trim().is_empty() {
            return Err("target must not be empty".to_string());
        }
        Ok(())
    }

    /// Probe `target`, returning no later than `deadline`.
    async fn probe(
        &self,
        target: &str,
        options: &ModuleOptions,
        deadline: Instant,
    ) -> ProbeOutcome;
}

/// Shared handle to a probe module.
pub type SharedProber = Arc<dyn Prober>;

/// The set of probe modules available to matrixes, keyed by prober name.
#[derive(Clone, Default)]
pub struct ProberSet {
    probers: HashMap<String, SharedProber>,
}

impl ProberSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in `dns`, `http` and `tcp` modules.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(DnsProber::new()));
        set.register(Arc::new(HttpProber::new()));
        set.register(Arc::new(TcpProber::new()));
        set
    }

    /// Register a module under its own name, replacing any previous one.
    pub fn register(&mut self, prober: SharedProber) {
        self.probers.insert(prober.name().to_string(), prober);
    }

    /// Look up a module by prober name.
    pub fn get(&self, name: &str) -> Option<SharedProber> {
        self.probers.get(name).cloned()
    }

    /// Registered prober names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.probers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProberSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProberSet")
            .field("probers", &self.names())
            .finish()
    }
}

/// Reject module sections that only make sense for another prober.
pub(crate) fn reject_foreign_sections(spec: &MatrixSpec, own: &str) -> Result<(), String> {
    if own != "dns" {
        if spec.dns.is_some() {
            return Err(format!("the dns section is not valid for prober '{}'", own));
        }
        if !spec.names.is_empty() {
            return Err(format!("names is not valid for prober '{}'", own));
        }
    }
    if own != "http" && spec.http.is_some() {
        return Err(format!("the http section is not valid for prober '{}'", own));
    }
    Ok(())
}

/// Split `host:port`, accepting bracketed IPv6 literals. Returns `None` for the
/// port when the target has none.
pub(crate) fn split_host_port(target: &str) -> Result<(String, Option<u16>), String> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in '{}'", target))?;
        let port = match tail {
            "" => None,
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| format!("expected ':' after ']' in '{}'", target))?;
                Some(parse_port(target, port)?)
            }
        };
        return Ok((host.to_string(), port));
    }

    // A bare IPv6 address has several colons and no port.
    if target.matches(':').count() > 1 {
        return Ok((target.to_string(), None));
    }

    match target.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(target, port)?))),
        None => Ok((target.to_string(), None)),
    }
}

fn parse_port(target: &str, port: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|_| format!("invalid port in '{}'", target))
}
