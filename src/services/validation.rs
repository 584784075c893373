//! Validation helpers for redirect settings and request data
//!
//! - Redirect targets must be absolute http/https URLs pointing at a public host
//! - Referrer domains are normalised to a bare `name.tld` form
//! - IP lists are parsed leniently, dropping entries that are not addresses

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Shape of a sanitised referrer domain
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9.-]+\.[a-z]{2,}$").expect("domain pattern is valid")
});

/// Why a configured redirect target was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRedirectUrl {
    #[error("not an absolute URL: {0}")]
    Unparsable(String),
    #[error("unsupported scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("host '{0}' is local or private")]
    LocalHost(String),
}

/// Parse and validate a redirect target.
pub fn parse_redirect_url(raw: &str) -> Result<Url, InvalidRedirectUrl> {
    let url = Url::parse(raw.trim())
        .map_err(|e| InvalidRedirectUrl::Unparsable(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(InvalidRedirectUrl::UnsupportedScheme(other.to_string())),
    }

    match url.host() {
        None => return Err(InvalidRedirectUrl::MissingHost),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            if domain.is_empty() || domain == "localhost" || domain.ends_with(".localhost") {
                return Err(InvalidRedirectUrl::LocalHost(domain.to_string()));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if !is_public_ip(IpAddr::V4(ip)) {
                return Err(InvalidRedirectUrl::LocalHost(ip.to_string()));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if !is_public_ip(IpAddr::V6(ip)) {
                return Err(InvalidRedirectUrl::LocalHost(ip.to_string()));
            }
        }
    }

    Ok(url)
}

/// True for addresses outside private, loopback, link-local and reserved ranges.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(a == 0
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || a >= 240
        || (a == 100 && (64..=127).contains(&b)))
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_unspecified()
        || ip.is_loopback()
        || (first & 0xfe00) == 0xfc00 // unique local
        || (first & 0xffc0) == 0xfe80) // link local
}

/// Lower-case a host and strip one leading `www.`
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

/// Reduce user input such as `https://www.Google.com/` to `google.com`.
///
/// Returns `None` when the result does not look like a domain name.
pub fn sanitize_domain(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let domain = normalize_host(host);

    if DOMAIN_RE.is_match(&domain) {
        Some(domain)
    } else {
        None
    }
}

/// Result of parsing a comma separated IP list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedIpList {
    pub addresses: BTreeSet<IpAddr>,
    pub rejected: Vec<String>,
}

/// Parse a comma or newline separated list of IP literals.
/// IPv4-mapped IPv6 entries are stored as plain IPv4.
pub fn parse_ip_list(raw: &str) -> ParsedIpList {
    let mut parsed = ParsedIpList::default();
    for entry in raw.split([',', '\n']).map(str::trim).filter(|e| !e.is_empty()) {
        match entry.parse::<IpAddr>() {
            Ok(ip) => {
                parsed.addresses.insert(ip.to_canonical());
            }
            Err(_) => parsed.rejected.push(entry.to_string()),
        }
    }
    parsed
}

/// Render an IP set back to its stored form
pub fn format_ip_list(addresses: &BTreeSet<IpAddr>) -> String {
    addresses
        .iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
