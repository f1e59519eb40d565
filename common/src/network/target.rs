//! # Target Normalizer
//!
//! Turns raw target tokens into the canonical flat list a scan runs against.
//!
//! A token can be:
//! * A URL (`https://example.com/app/`), reduced to its host plus a base path.
//! * A single IPv4/IPv6 address, optionally widened to its natural block.
//! * A dashed range (`10.0.0.1-10.0.0.9`, `10.0.0.1-9`, `2001:db8::1-2001:db8::ff`).
//! * A CIDR block (`10.0.0.0/30`, `2001:db8::/126`).
//! * Anything else (hostnames, domains), kept verbatim.
//!
//! Normalization never fails. Tokens that look like ranges but do not parse are
//! treated as hostnames.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::warn;

use crate::network::range::{self, IpRange};

/// Largest range a single token may expand to.
pub const MAX_EXPANSION: u128 = 65_536;

/// Classification of one raw token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetToken {
    Url { host: String, base_path: String },
    Address(IpAddr),
    Range(IpRange),
    Name(String),
}

impl TargetToken {
    /// Classifies a single, already trimmed token.
    pub fn classify(s: &str) -> Self {
        if s.contains("://") {
            let (host, base_path) = parse_url(s);
            return TargetToken::Url { host, base_path };
        }

        if let Ok(addr) = s.parse::<IpAddr>() {
            return TargetToken::Address(addr);
        }

        if let Some(range) = parse_ip_range(s).or_else(|| parse_cidr_range(s)) {
            return TargetToken::Range(range);
        }

        TargetToken::Name(s.to_string())
    }
}

/// The canonical target list plus the base path shared by URL targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedTargets {
    pub targets: Vec<String>,
    /// Base path of the last URL token seen. Shared by every target.
    pub url_base_path: String,
}

/// Normalizes raw tokens. Each item may itself be a comma-joined list.
pub fn normalize<I, S>(tokens: I, scan_ip_range: bool) -> NormalizedTargets
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = NormalizedTargets::default();
    let mut seen: HashSet<String> = HashSet::new();

    let mut push = |target: String, targets: &mut Vec<String>| {
        if seen.insert(target.clone()) {
            targets.push(target);
        }
    };

    for raw in tokens {
        for part in raw.as_ref().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            match TargetToken::classify(part) {
                TargetToken::Url { host, base_path } => {
                    out.url_base_path = base_path;
                    if !host.is_empty() {
                        push(host, &mut out.targets);
                    }
                }
                TargetToken::Address(addr) if scan_ip_range => {
                    for ip in expand(part, range::natural_block(addr)) {
                        push(ip, &mut out.targets);
                    }
                }
                TargetToken::Address(addr) => push(addr.to_string(), &mut out.targets),
                TargetToken::Range(ip_range) => {
                    for ip in expand(part, ip_range) {
                        push(ip, &mut out.targets);
                    }
                }
                TargetToken::Name(name) => push(name, &mut out.targets),
            }
        }
    }

    out
}

fn expand(token: &str, ip_range: IpRange) -> Vec<String> {
    let len: u128 = ip_range.len();
    if len > MAX_EXPANSION {
        warn!("Skipping {token}: expands to {len} addresses (limit {MAX_EXPANSION})");
        return Vec::new();
    }
    ip_range.to_iter().map(|ip| ip.to_string()).collect()
}

/// Splits a URL token into `(host, base_path)`.
///
/// `https://a.com/x/y` gives `("a.com", "x/y/")`. A missing or empty first path
/// segment gives an empty base path.
fn parse_url(s: &str) -> (String, String) {
    let Some((_scheme, rest)) = s.split_once("://") else {
        return (String::new(), String::new());
    };

    let mut segments = rest.split('/');
    let authority: &str = segments.next().unwrap_or_default();
    let path: Vec<&str> = segments.collect();

    let base_path: String = match path.first() {
        Some(first) if !first.is_empty() => {
            let mut joined: String = path.join("/");
            if !joined.ends_with('/') {
                joined.push('/');
            }
            joined
        }
        _ => String::new(),
    };

    (host_from_authority(authority), base_path)
}

fn host_from_authority(authority: &str) -> String {
    let host_port: &str = authority
        .rsplit_once('@')
        .map(|(_, hp)| hp)
        .unwrap_or(authority);

    if let Some(inner) = host_port.strip_prefix('[') {
        return inner.split(']').next().unwrap_or_default().to_string();
    }

    host_port.split(':').next().unwrap_or_default().to_string()
}

/// Parses `start-end`, where `end` may be abbreviated for IPv4.
fn parse_ip_range(s: &str) -> Option<IpRange> {
    let (start_str, end_str) = s.split_once('-')?;

    if let Ok(start_addr) = start_str.parse::<Ipv4Addr>() {
        let end_addr: Ipv4Addr = parse_range_end_addr(end_str, &start_addr)?;
        return Some(IpRange::v4(start_addr, end_addr));
    }

    let start_addr: Ipv6Addr = start_str.parse().ok()?;
    let end_addr: Ipv6Addr = end_str.parse().ok()?;
    Some(IpRange::v6(start_addr, end_addr))
}

/// Handles abbreviated forms like "192.168.1.1-50" (implies 192.168.1.50)
/// and full forms like "192.168.1.1-192.168.1.255".
fn parse_range_end_addr(end_str: &str, start_addr: &Ipv4Addr) -> Option<Ipv4Addr> {
    if let Ok(full_addr) = end_str.parse::<Ipv4Addr>() {
        return Some(full_addr);
    }

    let partial_octets: Vec<u8> = end_str
        .split('.')
        .map(|octet_str| octet_str.parse::<u8>())
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;

    if partial_octets.is_empty() || partial_octets.len() > 4 {
        return None;
    }

    let mut end_octets = start_addr.octets();
    let start_index: usize = 4 - partial_octets.len();
    end_octets[start_index..].copy_from_slice(&partial_octets);

    Some(Ipv4Addr::from(end_octets))
}

/// Parses CIDR notation for either family.
fn parse_cidr_range(s: &str) -> Option<IpRange> {
    let (ip_str, prefix_str) = s.split_once('/')?;
    let prefix: u8 = prefix_str.parse().ok()?;

    match ip_str.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => range::cidr_range_v4(v4, prefix).ok(),
        IpAddr::V6(v6) => range::cidr_range_v6(v6, prefix).ok(),
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
