//! Mapping of IPv4 destinations into a NAT64 /96 prefix.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use tracing::debug;

use crate::dns::{DnsCache, DohClient};
use crate::error::{Result, TunnelError};
use crate::protocol::Address;

/// Upper 96 bits of a NAT64 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat64Prefix([u16; 6]);

impl Nat64Prefix {
    /// Keeps the first 96 bits of `prefix`.
    pub fn new(prefix: Ipv6Addr) -> Self {
        let s = prefix.segments();
        Self([s[0], s[1], s[2], s[3], s[4], s[5]])
    }

    pub fn embed(&self, ipv4: Ipv4Addr) -> Ipv6Addr {
        let [a, b, c, d] = ipv4.octets();
        let p = self.0;
        Ipv6Addr::new(
            p[0],
            p[1],
            p[2],
            p[3],
            p[4],
            p[5],
            u16::from_be_bytes([a, b]),
            u16::from_be_bytes([c, d]),
        )
    }

    pub fn translate(&self, ipv4: &str) -> Result<Ipv6Addr> {
        Ok(self.embed(parse_ipv4(ipv4)?))
    }
}

impl Default for Nat64Prefix {
    fn default() -> Self {
        Self([0x2001, 0x67c, 0x2960, 0x6464, 0, 0])
    }
}

impl FromStr for Nat64Prefix {
    type Err = TunnelError;

    /// Accepts `2001:db8:64::` or `2001:db8:64::/96`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let addr = match s.split_once('/') {
            Some((addr, "96")) => addr,
            Some(_) => {
                return Err(TunnelError::Config(format!("NAT64 prefix {s} is not a /96")));
            }
            None => s,
        };
        addr.parse::<Ipv6Addr>()
            .map(Self::new)
            .map_err(|e| TunnelError::Config(format!("NAT64 prefix {s}: {e}")))
    }
}

pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    let invalid = || TunnelError::InvalidIpv4(s.to_owned());
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return Err(invalid());
    }
    let mut octets = [0u8; 4];
    for (octet, part) in octets.iter_mut().zip(parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *octet = part.parse().map_err(|_| invalid())?;
    }
    Ok(Ipv4Addr::from(octets))
}

/// Four groups of one to three digits, whether or not they are in range.
fn looks_like_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| (1..=3).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit()))
}

pub struct Nat64Resolver<'a, D, K> {
    doh: &'a D,
    cache: &'a K,
    prefix: Nat64Prefix,
}

impl<'a, D: DohClient, K: DnsCache> Nat64Resolver<'a, D, K> {
    pub fn new(doh: &'a D, cache: &'a K, prefix: Nat64Prefix) -> Self {
        Self { doh, cache, prefix }
    }

    pub async fn target_for(&self, address: &Address) -> Result<Ipv6Addr> {
        match address {
            Address::Ipv4(ip) => Ok(self.prefix.embed(*ip)),
            Address::Ipv6(_) => Err(TunnelError::UnsupportedAddressType),
            Address::Domain(domain) if looks_like_ipv4(domain) => self.prefix.translate(domain),
            Address::Domain(domain) if domain.contains(':') => {
                Err(TunnelError::UnsupportedAddressType)
            }
            Address::Domain(domain) => Ok(self.prefix.embed(self.resolve_ipv4(domain).await?)),
        }
    }

    pub async fn resolve_ipv4(&self, domain: &str) -> Result<Ipv4Addr> {
        if let Some(ip) = self.cache.get(domain) {
            debug!("dns cache hit {domain} -> {ip}");
            return Ok(ip);
        }
        let record = self
            .doh
            .query_a(domain)
            .await?
            .ok_or_else(|| TunnelError::Resolution(domain.to_owned()))?;
        let ip = parse_ipv4(&record)?;
        self.cache.put(domain, ip);
        debug!("resolved {domain} -> {ip}");
        Ok(ip)
    }
}
