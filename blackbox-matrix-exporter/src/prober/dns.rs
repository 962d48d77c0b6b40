//! DNS probe module.
//!
//! The target is the nameserver under test (`host` or `host:port`, port 53 by
//! default). Every configured name is resolved through it. With
//! `soa-inconsistency-fail` the module also locates the zone enclosing each name,
//! asks every authoritative server of that zone for its SOA and fails the probe
//! when the serials disagree, which is the usual sign of a secondary that stopped
//! transferring the zone.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, Resolver, TokioResolver};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::{
    ModuleOptions, ProbeOutcome, Prober, reason, reject_foreign_sections, split_host_port,
};
use crate::config::MatrixSpec;

const DNS_PORT: u16 = 53;

/// Options of a DNS matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsOptions {
    /// Names resolved through the target nameserver.
    pub names: Vec<String>,
    /// Fail when the authoritative servers of a zone report different SOA serials.
    pub soa_inconsistency_fail: bool,
}

/// Error type for DNS probes.
#[derive(Debug, thiserror::Error)]
pub enum DnsProbeError {
    #[error("cannot resolve nameserver '{target}': {message}")]
    Nameserver { target: String, message: String },
    #[error("lookup of '{name}' failed: {message}")]
    Resolve { name: String, message: String },
    #[error("no records for '{0}'")]
    NoRecords(String),
    #[error("no enclosing zone with NS records found for '{0}'")]
    ZoneNotFound(String),
    #[error("SOA query for zone '{zone}' to {server} failed: {message}")]
    SoaQuery {
        zone: String,
        server: String,
        message: String,
    },
    #[error("SOA serials for zone '{zone}' disagree: {serials}")]
    SoaInconsistent { zone: String, serials: String },
}

impl DnsProbeError {
    /// Failure reason reported for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Nameserver { .. } | Self::Resolve { .. } => "resolve_failed",
            Self::NoRecords(_) => "no_records",
            Self::ZoneNotFound(_) | Self::SoaQuery { .. } => "soa_query_failed",
            Self::SoaInconsistent { .. } => "soa_inconsistency",
        }
    }
}

/// DNS probe module.
#[derive(Debug, Clone)]
pub struct DnsProber {
    /// Port the authoritative servers are queried on for the SOA check.
    authority_port: u16,
}

impl Default for DnsProber {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsProber {
    /// Create the module.
    pub fn new() -> Self {
        Self {
            authority_port: DNS_PORT,
        }
    }

    /// Query authoritative servers on `port` instead of 53.
    pub fn with_authority_port(mut self, port: u16) -> Self {
        self.authority_port = port;
        self
    }

    async fn run(
        &self,
        target: &str,
        options: &DnsOptions,
        deadline: Instant,
    ) -> Result<(), DnsProbeError> {
        let (ips, port) = nameserver_addrs(target).await?;
        let resolver = build_resolver(&ips, port, deadline, true);

        for name in &options.names {
            let lookup = resolver
                .lookup_ip(name.as_str())
                .await
                .map_err(|e| classify(name, e))?;

            if lookup.iter().next().is_none() {
                return Err(DnsProbeError::NoRecords(name.clone()));
            }
            trace!(instance = %target, name = %name, "name resolved");

            if options.soa_inconsistency_fail {
                check_soa(&resolver, name, self.authority_port, deadline).await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Prober for DnsProber {
    fn name(&self) -> &str {
        "dns"
    }

    fn options(&self, spec: &MatrixSpec) -> Result<ModuleOptions, String> {
        reject_foreign_sections(spec, "dns")?;

        if spec.names.is_empty() {
            return Err("the dns prober needs at least one entry in names".to_string());
        }
        if spec.names.iter().any(|n| n.trim().is_empty()) {
            return Err("names must not contain empty entries".to_string());
        }

        Ok(ModuleOptions::Dns(DnsOptions {
            names: spec.names.clone(),
            soa_inconsistency_fail: spec
                .dns
                .as_ref()
                .is_some_and(|dns| dns.soa_inconsistency_fail),
        }))
    }

    fn validate_target(&self, target: &str) -> Result<(), String> {
        let (host, _) = split_host_port(target)?;
        if host.is_empty() {
            return Err(format!("missing nameserver host in '{}'", target));
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

        let ModuleOptions::Dns(options) = options else {
            error!(instance = %target, ?options, "dns prober called with foreign options");
            return ProbeOutcome::failure(target, start.elapsed(), reason::INTERNAL_ERROR);
        };

        match tokio::time::timeout_at(deadline, self.run(target, options, deadline)).await {
            Ok(Ok(())) => ProbeOutcome::success(target, start.elapsed()),
            Ok(Err(e)) => {
                debug!(instance = %target, error = %e, "DNS probe failed");
                ProbeOutcome::failure(target, start.elapsed(), e.reason())
            }
            Err(_) => {
                debug!(instance = %target, "DNS probe timed out");
                ProbeOutcome::failure(target, start.elapsed(), reason::TIMEOUT)
            }
        }
    }
}

/// Resolve the nameserver target into addresses and a port.
async fn nameserver_addrs(target: &str) -> Result<(Vec<IpAddr>, u16), DnsProbeError> {
    let (host, port) = split_host_port(target).map_err(|message| DnsProbeError::Nameserver {
        target: target.to_string(),
        message,
    })?;
    let port = port.unwrap_or(DNS_PORT);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok((vec![ip], port));
    }

    let ips: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| DnsProbeError::Nameserver {
            target: target.to_string(),
            message: e.to_string(),
        })?
        .map(|addr: SocketAddr| addr.ip())
        .collect();

    if ips.is_empty() {
        return Err(DnsProbeError::Nameserver {
            target: target.to_string(),
            message: "no addresses".to_string(),
        });
    }

    Ok((ips, port))
}

/// Build a resolver that only talks to `ips`.
///
/// The resolver's own timeout is set past `deadline` so that the caller's
/// `timeout_at` is what ends a slow probe.
fn build_resolver(
    ips: &[IpAddr],
    port: u16,
    deadline: Instant,
    recursion_desired: bool,
) -> TokioResolver {
    let config = ResolverConfig::from_parts(
        None,
        vec![],
        NameServerConfigGroup::from_ips_clear(ips, port, true),
    );

    let mut opts = ResolverOpts::default();
    opts.timeout = deadline.saturating_duration_since(Instant::now()) + Duration::from_secs(1);
    opts.attempts = 1;
    opts.recursion_desired = recursion_desired;

    Resolver::builder_with_config(config, TokioConnectionProvider::default())
        .with_options(opts)
        .build()
}

fn classify(name: &str, err: ResolveError) -> DnsProbeError {
    if err.is_no_records_found() {
        DnsProbeError::NoRecords(name.to_string())
    } else {
        DnsProbeError::Resolve {
            name: name.to_string(),
            message: err.to_string(),
        }
    }
}

/// Find the closest enclosing zone of `name` and its authoritative servers.
async fn find_zone(
    resolver: &TokioResolver,
    name: &str,
) -> Result<(String, Vec<String>), DnsProbeError> {
    let mut candidate = name.trim_end_matches('.').to_string();

    loop {
        match resolver.ns_lookup(format!("{}.", candidate)).await {
            Ok(lookup) => {
                let servers: Vec<String> = lookup.iter().map(|ns| ns.0.to_utf8()).collect();
                if !servers.is_empty() {
                    return Ok((candidate, servers));
                }
            }
            Err(e) if e.is_no_records_found() => {}
            Err(e) => {
                return Err(DnsProbeError::SoaQuery {
                    zone: candidate,
                    server: "target".to_string(),
                    message: format!("NS lookup failed: {}", e),
                });
            }
        }

        match candidate.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => candidate = parent.to_string(),
            _ => return Err(DnsProbeError::ZoneNotFound(name.to_string())),
        }
    }
}

/// Query the SOA serial of the zone enclosing `name` from every authoritative
/// server address and compare them.
async fn check_soa(
    resolver: &TokioResolver,
    name: &str,
    authority_port: u16,
    deadline: Instant,
) -> Result<(), DnsProbeError> {
    let (zone, servers) = find_zone(resolver, name).await?;
    debug!(zone = %zone, servers = ?servers, "checking SOA consistency");

    let mut queries = JoinSet::new();
    for server in servers {
        let ips: Vec<IpAddr> = resolver
            .lookup_ip(server.as_str())
            .await
            .map_err(|e| DnsProbeError::SoaQuery {
                zone: zone.clone(),
                server: server.clone(),
                message: format!("address lookup failed: {}", e),
            })?
            .iter()
            .collect();

        for ip in ips {
            let zone = format!("{}.", zone);
            let label = format!("{} ({})", server.trim_end_matches('.'), ip);
            queries.spawn(async move {
                let authority = build_resolver(&[ip], authority_port, deadline, false);
                let serial = authority
                    .soa_lookup(zone)
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|soa| {
                        soa.iter()
                            .next()
                            .map(|record| record.serial())
                            .ok_or_else(|| "empty SOA answer".to_string())
                    });
                (label, serial)
            });
        }
    }

    let serials = collect_serials(&zone, queries).await?;
    compare_serials(&zone, serials)
}

/// Wait for every SOA query. Any failed query, including a task that died,
/// fails the check.
async fn collect_serials(
    zone: &str,
    mut queries: JoinSet<(String, Result<u32, String>)>,
) -> Result<Vec<(String, u32)>, DnsProbeError> {
    let mut serials = Vec::new();
    while let Some(joined) = queries.join_next().await {
        let (server, serial) = joined.map_err(|e| DnsProbeError::SoaQuery {
            zone: zone.to_string(),
            server: "authority".to_string(),
            message: format!("query task failed: {}", e),
        })?;
        match serial {
            Ok(serial) => serials.push((server, serial)),
            Err(message) => {
                return Err(DnsProbeError::SoaQuery {
                    zone: zone.to_string(),
                    server,
                    message,
                });
            }
        }
    }
    Ok(serials)
}

/// Fail when the reported serials are not all equal.
fn compare_serials(zone: &str, serials: Vec<(String, u32)>) -> Result<(), DnsProbeError> {
    if serials.is_empty() {
        return Err(DnsProbeError::SoaQuery {
            zone: zone.to_string(),
            server: "authorities".to_string(),
            message: "no authoritative server answered".to_string(),
        });
    }

    let mut by_serial: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for (server, serial) in serials {
        by_serial.entry(serial).or_default().push(server);
    }

    if by_serial.len() > 1 {
        let serials = by_serial
            .iter()
            .map(|(serial, servers)| format!("{}: {}", serial, servers.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(DnsProbeError::SoaInconsistent {
            zone: zone.to_string(),
            serials,
        });
    }

    Ok(())
}
