//! CIDR address ranges tagged as included in or excluded from the tunnel
//!
//! Both families share one representation: the address is widened to a
//! `u128` and interpreted against the family's bit width (32 or 128).
//!
//! Ordering puts the lowest first address first and, among ranges that start
//! at the same address, the more specific (longer prefix) one first. Equality
//! ignores the `included` flag.

use super::routing::RouteError;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::cmp::{Ordering, Reverse};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Address width in bits
    pub fn width(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    fn all_ones(self) -> u128 {
        match self {
            Family::V4 => u32::MAX as u128,
            Family::V6 => u128::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AddressRange {
    base: u128,
    prefix_len: u8,
    family: Family,
    included: bool,
}

impl AddressRange {
    pub fn new(address: IpAddr, prefix_len: u8, included: bool) -> Result<Self, RouteError> {
        let (base, family) = match address {
            IpAddr::V4(v4) => (u32::from(v4) as u128, Family::V4),
            IpAddr::V6(v6) => (u128::from(v6), Family::V6),
        };
        if prefix_len > family.width() {
            return Err(RouteError::InvalidPrefix {
                prefix: prefix_len,
                width: family.width(),
            });
        }
        Ok(Self {
            base,
            prefix_len,
            family,
            included,
        })
    }

    /// Build an IPv4 range from a dotted address and a dotted netmask
    /// (`10.0.0.0` + `255.0.0.0`). The netmask must be contiguous.
    pub fn from_netmask(address: &str, netmask: &str, included: bool) -> Result<Self, RouteError> {
        let ip: Ipv4Addr = address
            .parse()
            .map_err(|_| RouteError::InvalidAddress(address.to_string()))?;
        let prefix_len = netmask_to_prefix(netmask)?;
        Self::new(IpAddr::V4(ip), prefix_len, included)
    }

    /// Parse `address/len`. A bare address is a host route.
    pub fn parse_cidr(text: &str, included: bool) -> Result<Self, RouteError> {
        let (addr_part, len_part) = match text.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (text, None),
        };
        let address: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| RouteError::InvalidAddress(text.to_string()))?;
        let prefix_len = match len_part {
            Some(l) => l
                .trim()
                .parse::<u8>()
                .map_err(|_| RouteError::InvalidAddress(text.to_string()))?,
            None => match address {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            },
        };
        Self::new(address, prefix_len, included)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_ipv6(&self) -> bool {
        self.family == Family::V6
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn included(&self) -> bool {
        self.included
    }

    pub fn with_included(mut self, included: bool) -> Self {
        self.included = included;
        self
    }

    fn mask(&self) -> u128 {
        let host_bits = self.family.width() - self.prefix_len;
        if self.prefix_len == 0 {
            0
        } else {
            (self.family.all_ones() >> host_bits) << host_bits
        }
    }

    /// First address of the range as an integer
    pub fn first(&self) -> u128 {
        self.base & self.mask()
    }

    /// Last address of the range as an integer
    pub fn last(&self) -> u128 {
        self.first() | (!self.mask() & self.family.all_ones())
    }

    /// The address as it was given, host bits included
    pub fn address(&self) -> IpAddr {
        to_ip(self.base, self.family)
    }

    pub fn network_address(&self) -> IpAddr {
        to_ip(self.first(), self.family)
    }

    /// Dotted netmask for IPv4 ranges
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        match self.family {
            Family::V4 => Some(Ipv4Addr::from(self.mask() as u32)),
            Family::V6 => None,
        }
    }

    /// Clear host bits. Returns true if the address was changed.
    pub fn normalize(&mut self) -> bool {
        let first = self.first();
        let changed = first != self.base;
        self.base = first;
        changed
    }

    pub fn contains(&self, other: &AddressRange) -> bool {
        self.family == other.family && self.first() <= other.first() && other.last() <= self.last()
    }

    pub fn contains_address(&self, address: IpAddr) -> bool {
        match Self::new(address, address_width(address), true) {
            Ok(host) => self.contains(&host),
            Err(_) => false,
        }
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.family == other.family && self.first() <= other.last() && other.first() <= self.last()
    }

    /// Bisect into the two halves one bit more specific. Returns `None`
    /// for a range already at full width.
    pub fn split(&self) -> Option<(AddressRange, AddressRange)> {
        if self.prefix_len >= self.family.width() {
            return None;
        }
        let prefix_len = self.prefix_len + 1;
        let lower = AddressRange {
            base: self.first(),
            prefix_len,
            ..*self
        };
        let upper = AddressRange {
            base: self.first() | (1u128 << (self.family.width() - prefix_len)),
            prefix_len,
            ..*self
        };
        Some((lower, upper))
    }

    fn sort_key(&self) -> (Family, u128, Reverse<u8>) {
        (self.family, self.first(), Reverse(self.prefix_len))
    }
}

fn address_width(address: IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_ip(value: u128, family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Convert a dotted netmask into a prefix length
pub fn netmask_to_prefix(netmask: &str) -> Result<u8, RouteError> {
    let mask: Ipv4Addr = netmask
        .parse()
        .map_err(|_| RouteError::InvalidNetmask(netmask.to_string()))?;
    let bits = u32::from(mask);
    let len = bits.leading_ones();
    let expected = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    if bits != expected {
        return Err(RouteError::InvalidNetmask(netmask.to_string()));
    }
    Ok(len as u8)
}

impl PartialEq for AddressRange {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for AddressRange {}

impl Hash for AddressRange {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state);
    }
}

impl PartialOrd for AddressRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address(), self.prefix_len)
    }
}

impl FromStr for AddressRange {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_cidr(s, true)
    }
}

impl Serialize for AddressRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AddressRange", 2)?;
        state.serialize_field("network", &self.to_string())?;
        state.serialize_field("included", &self.included)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: &str) -> AddressRange {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_cidr_v4() {
        let r = range("10.1.0.0/16");
        assert_eq!(r.prefix_len(), 16);
        assert!(!r.is_ipv6());
        assert_eq!(r.to_string(), "10.1.0.0/16");
        assert_eq!(r.first(), u32::from(Ipv4Addr::new(10, 1, 0, 0)) as u128);
        assert_eq!(r.last(), u32::from(Ipv4Addr::new(10, 1, 255, 255)) as u128);
    }

    #[test]
    fn test_bare_address_is_host_route() {
        assert_eq!(range("192.168.1.7").prefix_len(), 32);
        assert_eq!(range("2001:db8::1").prefix_len(), 128);
    }

    #[test]
    fn test_prefix_too_long() {
        assert!(matches!(
            "10.0.0.0/33".parse::<AddressRange>(),
            Err(RouteError::InvalidPrefix { prefix: 33, width: 32 })
        ));
    }

    #[test]
    fn test_from_netmask() {
        let r = AddressRange::from_netmask("10.0.0.0", "255.0.0.0", true).unwrap();
        assert_eq!(r.prefix_len(), 8);
        assert_eq!(r.netmask(), Some(Ipv4Addr::new(255, 0, 0, 0)));

        let host = AddressRange::from_netmask("1.2.3.4", "255.255.255.255", false).unwrap();
        assert_eq!(host.prefix_len(), 32);
        assert!(!host.included());
    }

    #[test]
    fn test_non_contiguous_netmask_rejected() {
        let err = AddressRange::from_netmask("10.0.0.0", "255.0.255.0", true).unwrap_err();
        assert!(matches!(err, RouteError::InvalidNetmask(_)));
        assert!(netmask_to_prefix("garbage").is_err());
        assert_eq!(netmask_to_prefix("0.0.0.0").unwrap(), 0);
    }

    #[test]
    fn test_normalize_clears_host_bits() {
        let mut r = range("10.1.2.3/16");
        assert!(r.normalize());
        assert_eq!(r.to_string(), "10.1.0.0/16");
        assert!(!r.normalize());
    }

    #[test]
    fn test_split() {
        let (lower, upper) = range("10.0.0.0/8").split().unwrap();
        assert_eq!(lower.to_string(), "10.0.0.0/9");
        assert_eq!(upper.to_string(), "10.128.0.0/9");

        let (lower, upper) = range("2001:db8::/32").split().unwrap();
        assert_eq!(lower.to_string(), "2001:db8::/33");
        assert_eq!(upper.to_string(), "2001:db8:8000::/33");

        assert!(range("10.0.0.1/32").split().is_none());
        assert!(range("::1/128").split().is_none());
    }

    #[test]
    fn test_split_default_route() {
        let (lower, upper) = range("0.0.0.0/0").split().unwrap();
        assert_eq!(lower.to_string(), "0.0.0.0/1");
        assert_eq!(upper.to_string(), "128.0.0.0/1");

        let (lower, upper) = range("::/0").split().unwrap();
        assert_eq!(lower.to_string(), "::/1");
        assert_eq!(upper.to_string(), "8000::/1");
    }

    #[test]
    fn test_ordering_more_specific_first() {
        let mut ranges = vec![range("10.0.0.0/8"), range("9.0.0.0/8"), range("10.0.0.0/16")];
        ranges.sort();
        let text: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        assert_eq!(text, vec!["9.0.0.0/8", "10.0.0.0/16", "10.0.0.0/8"]);
    }

    #[test]
    fn test_equality_ignores_included() {
        let a = AddressRange::parse_cidr("10.0.0.0/8", true).unwrap();
        let b = AddressRange::parse_cidr("10.0.0.0/8", false).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, range("10.0.0.0/9"));
        // Host bits do not affect equality
        assert_eq!(range("10.0.0.1/8"), a);
    }

    #[test]
    fn test_contains_and_overlaps() {
        let big = range("10.0.0.0/8");
        let small = range("10.1.0.0/16");
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
        assert!(big.overlaps(&small));
        assert!(!small.overlaps(&range("10.2.0.0/16")));
        assert!(!big.contains(&range("::/0")));
        assert!(big.contains_address("10.200.1.1".parse().unwrap()));
        assert!(!big.contains_address("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_serialize() {
        let r = AddressRange::parse_cidr("10.0.0.0/8", false).unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"network":"10.0.0.0/8","included":false}"#);
    }
}
