//! # Address Ranges
//!
//! Inclusive IPv4/IPv6 ranges and the block arithmetic used when a target token
//! has to be expanded into individual addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::ipnetwork::{Ipv4Network, Ipv6Network};

/// Prefix of the block a lone IPv4 literal expands to under `scan_ip_range`.
pub const IPV4_NATURAL_PREFIX: u8 = 24;
/// Prefix of the block a lone IPv6 literal expands to under `scan_ip_range`.
pub const IPV6_NATURAL_PREFIX: u8 = 120;

/// A continuous, inclusive range of addresses of one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpRange {
    V4 { start_addr: Ipv4Addr, end_addr: Ipv4Addr },
    V6 { start_addr: Ipv6Addr, end_addr: Ipv6Addr },
}

impl IpRange {
    pub fn v4(start_addr: Ipv4Addr, end_addr: Ipv4Addr) -> Self {
        Self::V4 {
            start_addr,
            end_addr,
        }
    }

    pub fn v6(start_addr: Ipv6Addr, end_addr: Ipv6Addr) -> Self {
        Self::V6 {
            start_addr,
            end_addr,
        }
    }

    /// Number of addresses covered. Zero when start > end.
    pub fn len(&self) -> u128 {
        let (start, end) = self.bounds();
        if start > end { 0 } else { end - start + 1 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_iter(&self) -> Box<dyn Iterator<Item = IpAddr> + Send> {
        match *self {
            IpRange::V4 {
                start_addr,
                end_addr,
            } => {
                let start: u32 = start_addr.into();
                let end: u32 = end_addr.into();
                Box::new((start..=end).map(|ip| IpAddr::V4(Ipv4Addr::from(ip))))
            }
            IpRange::V6 {
                start_addr,
                end_addr,
            } => {
                let start: u128 = start_addr.into();
                let end: u128 = end_addr.into();
                Box::new((start..=end).map(|ip| IpAddr::V6(Ipv6Addr::from(ip))))
            }
        }
    }

    fn bounds(&self) -> (u128, u128) {
        match *self {
            IpRange::V4 {
                start_addr,
                end_addr,
            } => (u32::from(start_addr) as u128, u32::from(end_addr) as u128),
            IpRange::V6 {
                start_addr,
                end_addr,
            } => (u128::from(start_addr), u128::from(end_addr)),
        }
    }
}

/// Range covering the whole IPv4 network `ip/prefix`.
pub fn cidr_range_v4(ip: Ipv4Addr, prefix: u8) -> anyhow::Result<IpRange> {
    let network = Ipv4Network::new(ip, prefix)?;
    Ok(IpRange::v4(network.network(), network.broadcast()))
}

/// Range covering the whole IPv6 network `ip/prefix`.
pub fn cidr_range_v6(ip: Ipv6Addr, prefix: u8) -> anyhow::Result<IpRange> {
    // Validates the prefix; the bounds are computed below.
    Ipv6Network::new(ip, prefix)?;

    let ip_u128: u128 = ip.into();
    let mask: u128 = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    };
    let network: u128 = ip_u128 & mask;
    let last: u128 = network | !mask;

    Ok(IpRange::v6(Ipv6Addr::from(network), Ipv6Addr::from(last)))
}

/// The block a single address naturally belongs to.
pub fn natural_block(addr: IpAddr) -> IpRange {
    match addr {
        IpAddr::V4(v4) => cidr_range_v4(v4, IPV4_NATURAL_PREFIX)
            .unwrap_or_else(|_| IpRange::v4(v4, v4)),
        IpAddr::V6(v6) => cidr_range_v6(v6, IPV6_NATURAL_PREFIX)
            .unwrap_or_else(|_| IpRange::v6(v6, v6)),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_range_iterates_inclusive() {
        let range = IpRange::v4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3));
        let ips: Vec<IpAddr> = range.to_iter().collect();
        assert_eq!(
            ips,
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            ]
        );
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn reversed_range_is_empty() {
        let range = IpRange::v4(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1));
        assert!(range.is_empty());
        assert_eq!(range.to_iter().count(), 0);
    }

    #[test]
    fn cidr_v4_covers_network_and_broadcast() {
        let range = cidr_range_v4(Ipv4Addr::new(192, 168, 1, 100), 24).unwrap();
        assert_eq!(
            range,
            IpRange::v4(Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::new(192, 168, 1, 255))
        );
    }

    #[test]
    fn cidr_v4_rejects_bad_prefix() {
        assert!(cidr_range_v4(Ipv4Addr::new(192, 168, 1, 1), 33).is_err());
    }

    #[test]
    fn cidr_v6_small_block() {
        let ip: Ipv6Addr = "2001:db8::17".parse().unwrap();
        let range = cidr_range_v6(ip, 126).unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!(
            range.to_iter().next(),
            Some(IpAddr::V6("2001:db8::14".parse().unwrap()))
        );
    }

    #[test]
    fn cidr_v6_rejects_bad_prefix() {
        assert!(cidr_range_v6(Ipv6Addr::LOCALHOST, 129).is_err());
    }

    #[test]
    fn natural_block_sizes() {
        let v4 = natural_block(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(v4.len(), 256);
        let v6 = natural_block(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(v6.len(), 256);
    }
}
