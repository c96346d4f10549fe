//! Server address parsing and SRV resolution (RFC 6120 §3.2).
//!
//! Turns the configured server string (bare domain, `tls://host:port`, ...)
//! into an ordered list of [`Endpoint`]s. The TCP transport walks that list and
//! falls through to the next entry when an endpoint is unreachable.

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::proto::rr::rdata::SRV;
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::Result;

const DEFAULT_STARTTLS_PORT: u16 = 5222;
const DEFAULT_DIRECT_TLS_PORT: u16 = 5223;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// How TLS is established on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain TCP, upgraded in-band through STARTTLS.
    StartTls,
    /// TLS from the first byte (XEP-0368).
    Direct,
}

/// One connectable server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: TlsMode,
    /// XMPP domain when it differs from `host` (SRV target). TLS must verify
    /// against the domain, not the target (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl Endpoint {
    /// Name used for SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

/// Parsed form of a configured server string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    /// Explicit endpoint, no SRV lookup.
    Direct(Endpoint),
    /// Domain to resolve through SRV.
    Domain(String),
}

/// Extract optional `?domain=` parameter.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (host_port, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

fn with_port(host_port: &str, default_port: u16) -> (String, u16) {
    // rsplit_once keeps IPv6 literals intact
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host_port.to_string(), default_port),
        },
        None => (host_port.to_string(), default_port),
    }
}

/// Parse a server string.
///
/// - `tls://host[:port][?domain=d]` → direct TLS (default port 5223)
/// - `tcp://host[:port][?domain=d]` → STARTTLS (default port 5222)
/// - `host:port` → direct; port 5223 means direct TLS, anything else STARTTLS
/// - `domain` → SRV resolution
pub fn parse_server(input: &str) -> ServerAddress {
    let trimmed = input.trim();

    for (scheme, mode, default_port) in [
        ("tls://", TlsMode::Direct, DEFAULT_DIRECT_TLS_PORT),
        ("tcp://", TlsMode::StartTls, DEFAULT_STARTTLS_PORT),
    ] {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let (host_port, domain) = split_domain_param(rest);
            let (host, port) = with_port(host_port, default_port);
            return ServerAddress::Direct(Endpoint {
                host,
                port,
                mode,
                domain,
            });
        }
    }

    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let mode = if port == DEFAULT_DIRECT_TLS_PORT {
                TlsMode::Direct
            } else {
                TlsMode::StartTls
            };
            return ServerAddress::Direct(Endpoint {
                host: host.to_string(),
                port,
                mode,
                domain: None,
            });
        }
    }

    ServerAddress::Domain(trimmed.to_string())
}

/// Order SRV records per RFC 2782: priority ascending, then weight descending.
/// Records whose target is `.` (service explicitly unavailable) are dropped.
fn ordered_targets(records: &[SRV]) -> Vec<(String, u16)> {
    let mut sorted: Vec<&SRV> = records.iter().collect();
    sorted.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then(b.weight().cmp(&a.weight()))
    });
    sorted
        .into_iter()
        .filter_map(|r| {
            let target = r.target().to_string().trim_end_matches('.').to_string();
            (!target.is_empty()).then_some((target, r.port()))
        })
        .collect()
}

async fn lookup(resolver: &TokioAsyncResolver, domain: &str, service: &str) -> Vec<(String, u16)> {
    let srv_name = format!("{}._tcp.{}", service, domain);
    let started = Instant::now();
    match resolver.srv_lookup(&srv_name).await {
        Ok(found) => {
            let records: Vec<SRV> = found.iter().cloned().collect();
            let targets = ordered_targets(&records);
            info!(domain, srv = %srv_name, count = targets.len(), lookup_ms = elapsed_ms(started),
                "SRV lookup complete");
            targets
        }
        Err(e) => {
            info!(domain, srv = %srv_name, lookup_ms = elapsed_ms(started), error = %e,
                "SRV lookup failed");
            Vec::new()
        }
    }
}

/// Resolve `domain` to candidate endpoints, in connection-attempt order:
/// `_xmpps-client` (direct TLS) records, then `_xmpp-client` (STARTTLS)
/// records, then `domain:5222` only when no SRV record exists at all.
pub async fn resolve(domain: &str) -> Result<Vec<Endpoint>> {
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system DNS config: {}, falling back to default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = Vec::new();
    for (service, mode) in [
        ("_xmpps-client", TlsMode::Direct),
        ("_xmpp-client", TlsMode::StartTls),
    ] {
        for (host, port) in lookup(&resolver, domain, service).await {
            endpoints.push(Endpoint {
                host,
                port,
                mode,
                domain: Some(domain.to_string()),
            });
        }
    }

    if endpoints.is_empty() {
        warn!(domain, resolve_total_ms = elapsed_ms(started),
            "No SRV records found, using fallback {}:{}", domain, DEFAULT_STARTTLS_PORT);
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: DEFAULT_STARTTLS_PORT,
            mode: TlsMode::StartTls,
            domain: None,
        });
    } else {
        info!(domain, total = endpoints.len(), resolve_total_ms = elapsed_ms(started),
            "SRV resolution complete");
    }
    Ok(endpoints)
}
