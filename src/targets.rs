//! Target expressions and local network detection.

use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr};

use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use tracing::warn;

use crate::error::{Error, Result};

/// Largest number of addresses one range or CIDR part may expand to (a /16).
pub const MAX_PART_HOSTS: u64 = 65_536;

/// Expand a comma-separated target expression into sorted, unique addresses.
///
/// Accepted parts:
/// - single address: `192.168.1.10`
/// - CIDR block: `192.168.1.0/24` (host addresses only)
/// - full range: `192.168.1.3-192.168.1.10`
/// - last-octet range: `192.168.1.3-10`
///
/// Malformed or oversized parts are skipped.
pub fn expand_target(target: &str) -> Vec<IpAddr> {
    let mut out = BTreeSet::new();
    for part in target.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match expand_part(part) {
            Some(ips) => out.extend(ips),
            None => warn!(part, "skipping malformed target"),
        }
    }
    out.into_iter().collect()
}

/// Like [`expand_target`], but an expression that yields no address is an input error.
pub fn parse_targets(target: &str) -> Result<Vec<IpAddr>> {
    let ips = expand_target(target);
    if ips.is_empty() {
        return Err(Error::InvalidTarget(target.to_string()));
    }
    Ok(ips)
}

fn expand_part(part: &str) -> Option<Vec<IpAddr>> {
    if part.contains('/') {
        let net: IpNet = part.parse().ok()?;
        let net = net.trunc();
        if let IpNet::V4(n4) = net {
            if host_count(n4) > MAX_PART_HOSTS {
                return None;
            }
        }
        return Some(expand_cidr_to_ips(net));
    }

    if let Some((start, end)) = part.split_once('-') {
        let (start, end) = (start.trim(), end.trim());
        let start: Ipv4Addr = start.parse().ok()?;
        let end: Ipv4Addr = if end.contains('.') {
            end.parse().ok()?
        } else {
            let last: u8 = end.parse().ok()?;
            let o = start.octets();
            Ipv4Addr::new(o[0], o[1], o[2], last)
        };
        let (lo, hi) = ordered(u32::from(start), u32::from(end));
        if u64::from(hi - lo) + 1 > MAX_PART_HOSTS {
            return None;
        }
        return Some((lo..=hi).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect());
    }

    part.parse::<IpAddr>().ok().map(|ip| vec![ip])
}

fn ordered(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn host_count(net: Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(net.prefix_len()))
}

/// Detect local non-loopback IPv4 addresses and turn each into its /24 network.
///
/// `192.168.1.42` becomes `192.168.1.0/24`. Duplicates are removed.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    let mut cidrs: Vec<Ipv4Net> = set.into_iter().collect();
    cidrs.sort_by_key(|n| (u32::from(n.network()), n.prefix_len()));
    Ok(cidrs.into_iter().map(IpNet::V4).collect())
}

/// Every host of every locally attached /24.
pub fn local_targets() -> Result<Vec<IpAddr>> {
    let mut out = BTreeSet::new();
    for cidr in detect_local_cidrs()? {
        out.extend(expand_cidr_to_ips(cidr));
    }
    Ok(out.into_iter().collect())
}

/// Host addresses of a network. IPv4 drops network and broadcast except on /31 and /32;
/// IPv6 networks are not expanded.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => n4.hosts().map(IpAddr::V4).collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    // /24 is always a valid prefix
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).unwrap_or_default()
}
