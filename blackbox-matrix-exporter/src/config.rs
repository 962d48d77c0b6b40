//! Configuration for the blackbox matrix exporter.
//!
//! The configuration is a YAML document. Every section rejects unknown fields so
//! that a typo fails at startup instead of silently producing a misconfigured
//! probe at scrape time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ExporterConfig {
    /// Named matrixes of probe targets.
    pub matrixes: BTreeMap<String, MatrixSpec>,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One matrix entry as written in the configuration file.
///
/// Module-specific sections (`dns`, `names`, `http`) are checked by the probe
/// module named in `prober` when the target registry is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct MatrixSpec {
    /// Name of the probe module, e.g. `dns`, `http` or `tcp`.
    pub prober: String,

    /// Probe targets, in report order.
    pub instances: Vec<String>,

    /// DNS module options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSpec>,

    /// Names resolved by the DNS module.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// HTTP module options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSpec>,

    /// Fixed per-target timeout, capped by the overall probe deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// DNS module options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DnsSpec {
    /// Fail the probe when the authoritative nameservers of a zone disagree on
    /// its SOA serial.
    #[serde(default)]
    pub soa_inconsistency_fail: bool,
}

/// HTTP module options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpSpec {
    /// Accepted status codes (empty = any 2xx).
    #[serde(default)]
    pub valid_status_codes: Vec<u16>,

    /// Follow redirects (default: true).
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
}

fn default_follow_redirects() -> bool {
    true
}

impl Default for HttpSpec {
    fn default() -> Self {
        Self {
            valid_status_codes: Vec::new(),
            follow_redirects: default_follow_redirects(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:9999").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upper bound for one matrix execution, in milliseconds (default: 9500).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Subtracted from the scrape timeout Prometheus announces (default: 500).
    #[serde(default = "default_scrape_timeout_offset_ms")]
    pub scrape_timeout_offset_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    9_500
}

fn default_scrape_timeout_offset_ms() -> u64 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            probe_timeout_ms: default_probe_timeout_ms(),
            scrape_timeout_offset_ms: default_scrape_timeout_offset_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the module-independent parts of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .server
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            )));
        }

        if self.server.probe_timeout_ms == 0 {
            return Err(ConfigError::validation("probe-timeout-ms must be > 0"));
        }

        for (name, matrix) in &self.matrixes {
            if name.trim().is_empty() {
                return Err(ConfigError::validation("matrix names must not be empty"));
            }

            if matrix.prober.trim().is_empty() {
                return Err(ConfigError::validation(format!(
                    "matrix '{}': prober must not be empty",
                    name
                )));
            }

            if matrix.instances.is_empty() {
                return Err(ConfigError::validation(format!(
                    "matrix '{}': instances must not be empty",
                    name
                )));
            }

            if let Some(pos) = matrix.instances.iter().position(|i| i.trim().is_empty()) {
                return Err(ConfigError::validation(format!(
                    "matrix '{}': instance #{} is empty",
                    name, pos
                )));
            }

            if matrix.timeout_ms == Some(0) {
                return Err(ConfigError::validation(format!(
                    "matrix '{}': timeout-ms must be > 0",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
matrixes:
  web:
    prober: http
    instances: ["https://example.com"]
"#;
        let config = ExporterConfig::parse(yaml).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:9999");
        assert_eq!(config.server.probe_timeout_ms, 9_500);
        assert_eq!(config.server.scrape_timeout_offset_ms, 500);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);

        let web = &config.matrixes["web"];
        assert_eq!(web.prober, "http");
        assert_eq!(web.instances, vec!["https://example.com"]);
        assert!(web.dns.is_none());
        assert!(web.names.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  listen: "127.0.0.1:9115"
  probe-timeout-ms: 4000
  scrape-timeout-offset-ms: 250
logging:
  level: debug
  format: json
matrixes:
  resolvers:
    prober: dns
    instances: ["9.9.9.9", "1.1.1.1:53"]
    names: ["example.com", "example.org"]
    timeout-ms: 1500
    dns:
      soa-inconsistency-fail: true
  web:
    prober: http
    instances: ["https://example.com/health"]
    http:
      valid-status-codes: [200, 204]
      follow-redirects: false
"#;
        let config = ExporterConfig::parse(yaml).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9115");
        assert_eq!(config.server.probe_timeout_ms, 4000);
        assert_eq!(config.server.scrape_timeout_offset_ms, 250);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        let dns = &config.matrixes["resolvers"];
        assert_eq!(dns.prober, "dns");
        assert_eq!(dns.names, vec!["example.com", "example.org"]);
        assert_eq!(dns.timeout_ms, Some(1500));
        assert_eq!(
            dns.dns,
            Some(DnsSpec {
                soa_inconsistency_fail: true
            })
        );

        let web = &config.matrixes["web"];
        let http = web.http.as_ref().unwrap();
        assert_eq!(http.valid_status_codes, vec![200, 204]);
        assert!(!http.follow_redirects);
    }

    #[test]
    fn test_unknown_matrix_field_rejected() {
        let yaml = r#"
matrixes:
  web:
    prober: http
    instances: ["https://example.com"]
    instance: ["typo"]
"#;
        let err = ExporterConfig::parse(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let yaml = r#"
matrixes: {}
matrices: {}
"#;
        let err = ExporterConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_unknown_dns_option_rejected() {
        let yaml = r#"
matrixes:
  resolvers:
    prober: dns
    instances: ["9.9.9.9"]
    names: ["example.com"]
    dns:
      soa-inconsistency: true
"#;
        let err = ExporterConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_missing_matrixes_rejected() {
        let yaml = "logging: { level: debug }\n";
        assert!(ExporterConfig::parse(yaml).is_err());
    }

    #[test]
    fn test_empty_instances_rejected() {
        let yaml = r#"
matrixes:
  web:
    prober: http
    instances: []
"#;
        let err = ExporterConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("instances must not be empty"));
    }

    #[test]
    fn test_blank_instance_rejected() {
        let yaml = r#"
matrixes:
  web:
    prober: tcp
    instances: ["localhost:22", " "]
"#;
        let err = ExporterConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("instance #1 is empty"));
    }

    #[test]
    fn test_validate_invalid_listen() {
        let yaml = r#"
server:
  listen: "not-an-address"
matrixes: {}
"#;
        let err = ExporterConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("Invalid listen address"));
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let yaml = r#"
server:
  probe-timeout-ms: 0
matrixes: {}
"#;
        assert!(ExporterConfig::parse(yaml).is_err());

        let yaml = r#"
matrixes:
  web:
    prober: tcp
    instances: ["localhost:22"]
    timeout-ms: 0
"#;
        let err = ExporterConfig::parse(yaml).unwrap_err();
        assert!(err.to_string().contains("timeout-ms must be > 0"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ExporterConfig::load_from_file("/nonexistent/blackbox-matrix.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
