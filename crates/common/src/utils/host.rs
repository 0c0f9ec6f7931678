use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::net::IpAddr;
use tracing::debug;

/// Matches an HTTP `Host:` header line anywhere in the first segment
static HOST_HEADER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Host:[ \t]*([^\r\n]+)").unwrap());

/// Extract the routed subdomain from the first bytes of a public connection
///
/// Returns the first DNS label of the `Host:` header value with any port removed,
/// e.g. `Host: abc123.tunnel.example.com:4000` -> `abc123`. Only the header is
/// inspected; the payload itself is never interpreted.
pub fn extract_subdomain(data: &[u8]) -> Option<String> {
    let captures = HOST_HEADER_REGEX.captures(data)?;
    let value = std::str::from_utf8(captures.get(1)?.as_bytes()).ok()?.trim();

    let label = value.split('.').next().unwrap_or_default();
    let label = label.split(':').next().unwrap_or_default();

    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

/// Whether `host` names the local machine
pub fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Substitute a container-bridge alias for loopback hosts when the alias resolves
///
/// Inside a Docker Desktop container `127.0.0.1` is the container itself; the host
/// machine is reachable as `host.docker.internal`.
pub async fn resolve_container_host(host: &str, alias: Option<&str>) -> String {
    let Some(alias) = alias else {
        return host.to_string();
    };

    if !is_loopback_host(host) {
        return host.to_string();
    }

    let resolved = tokio::net::lookup_host((alias, 0))
        .await
        .map(|mut addrs| addrs.next().is_some());

    match resolved {
        Ok(true) => {
            debug!("Loopback host {} replaced with {}", host, alias);
            alias.to_string()
        }
        _ => host.to_string(),
    }
}
