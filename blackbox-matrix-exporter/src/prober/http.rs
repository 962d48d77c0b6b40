//! HTTP probe module.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use tokio::time::Instant;
use tracing::{debug, error};

use super::{ModuleOptions, ProbeOutcome, Prober, reason, reject_foreign_sections};
use crate::config::MatrixSpec;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Options of an HTTP matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    /// Accepted status codes (empty = any 2xx).
    pub valid_status_codes: Vec<u16>,
    /// Follow redirects.
    pub follow_redirects: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            valid_status_codes: Vec::new(),
            follow_redirects: true,
        }
    }
}

impl HttpOptions {
    /// Whether `status` counts as a successful probe.
    pub fn accepts(&self, status: StatusCode) -> bool {
        if self.valid_status_codes.is_empty() {
            status.is_success()
        } else {
            self.valid_status_codes.contains(&status.as_u16())
        }
    }
}

/// Error type for HTTP probes.
#[derive(Debug, thiserror::Error)]
pub enum HttpProbeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),
}

impl HttpProbeError {
    /// Failure reason reported for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Request(_) => "request_failed",
            Self::UnexpectedStatus(_) => "unexpected_status",
        }
    }
}

/// HTTP probe module.
///
/// A new client is built for every probe, so each probe measures a fresh
/// connection and nothing is shared between scrapes.
#[derive(Debug, Clone, Default)]
pub struct HttpProber;

impl HttpProber {
    /// Create the module.
    pub fn new() -> Self {
        Self
    }

    async fn run(
        &self,
        target: &str,
        options: &HttpOptions,
        deadline: Instant,
    ) -> Result<StatusCode, HttpProbeError> {
        let policy = if options.follow_redirects {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        };

        // The caller's deadline ends the probe; the client timeout only backs it up.
        let client = Client::builder()
            .redirect(policy)
            .timeout(deadline.saturating_duration_since(Instant::now()) + Duration::from_secs(1))
            .build()?;

        let status = client.get(target).send().await?.status();
        if options.accepts(status) {
            Ok(status)
        } else {
            Err(HttpProbeError::UnexpectedStatus(status))
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    fn name(&self) -> &str {
        "http"
    }

    fn options(&self, spec: &MatrixSpec) -> Result<ModuleOptions, String> {
        reject_foreign_sections(spec, "http")?;

        let Some(http) = &spec.http else {
            return Ok(ModuleOptions::Http(HttpOptions::default()));
        };

        if let Some(code) = http
            .valid_status_codes
            .iter()
            .find(|code| StatusCode::from_u16(**code).is_err())
        {
            return Err(format!("invalid status code {} in valid-status-codes", code));
        }

        Ok(ModuleOptions::Http(HttpOptions {
            valid_status_codes: http.valid_status_codes.clone(),
            follow_redirects: http.follow_redirects,
        }))
    }

    fn validate_target(&self, target: &str) -> Result<(), String> {
        let url = Url::parse(target).map_err(|e| format!("invalid URL '{}': {}", target, e))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(format!("unsupported scheme '{}' in '{}'", other, target)),
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(format!("missing host in '{}'", target));
        }
        Ok(())
    }

    async fn probe(
        &self,
        target: &str,
        options: &ModuleOptions,
        deadline: Instant,
    ) -> ProbeOutcome {
        let start = Instant::now();

        let ModuleOptions::Http(options) = options else {
            error!(instance = %target, ?options, "http prober called with foreign options");
            return ProbeOutcome::failure(target, start.elapsed(), reason::INTERNAL_ERROR);
        };

        match tokio::time::timeout_at(deadline, self.run(target, options, deadline)).await {
            Ok(Ok(status)) => {
                debug!(instance = %target, %status, "HTTP probe succeeded");
                ProbeOutcome::success(target, start.elapsed())
            }
            Ok(Err(e)) => {
                debug!(instance = %target, error = %e, "HTTP probe failed");
                ProbeOutcome::failure(target, start.elapsed(), e.reason())
            }
            Err(_) => {
                debug!(instance = %target, "HTTP probe timed out");
                ProbeOutcome::failure(target, start.elapsed(), reason::TIMEOUT)
            }
        }
    }
}
