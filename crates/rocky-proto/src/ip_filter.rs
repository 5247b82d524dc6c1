//! IP address filtering with CIDR support
//!
//! Entries are either individual addresses ("192.168.1.100", "::1") or CIDR
//! ranges ("10.0.0.0/8"). A filter has an allow list and a block list. The block
//! list always wins; an empty allow list admits every address not blocked.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

/// IP filter errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpFilterError {
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

/// Address-based admission filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
    allowlist: Vec<IpNet>,
    blocklist: Vec<IpNet>,
}

/// Parse a CIDR string or a single address (treated as /32 or /128)
pub fn parse_network(entry: &str) -> Result<IpNet, IpFilterError> {
    let entry = entry.trim();
    if entry.contains('/') {
        IpNet::from_str(entry).map_err(|_| IpFilterError::InvalidCidr(entry.to_string()))
    } else {
        IpAddr::from_str(entry)
            .map(IpNet::from)
            .map_err(|_| IpFilterError::InvalidIpAddress(entry.to_string()))
    }
}

fn parse_all<S: AsRef<str>>(entries: &[S]) -> Result<Vec<IpNet>, IpFilterError> {
    entries
        .iter()
        .map(|entry| entry.as_ref())
        .filter(|entry| !entry.trim().is_empty())
        .map(parse_network)
        .collect()
}

impl IpFilter {
    /// Create a filter that allows all connections
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from textual allow and block lists
    ///
    /// Blank entries are ignored. The first invalid entry fails the whole
    /// filter so a typo never silently widens access.
    pub fn from_lists<A, B>(allowlist: &[A], blocklist: &[B]) -> Result<Self, IpFilterError>
    where
        A: AsRef<str>,
        B: AsRef<str>,
    {
        Ok(Self {
            allowlist: parse_all(allowlist)?,
            blocklist: parse_all(blocklist)?,
        })
    }

    /// True when the address is admitted
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        !self.is_blocked(ip) && self.is_allowlisted(ip)
    }

    /// True when the address falls into the block list
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.blocklist.iter().any(|net| net.contains(&ip))
    }

    /// True when the allow list is empty or contains the address
    pub fn is_allowlisted(&self, ip: &IpAddr) -> bool {
        if self.allowlist.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        self.allowlist.iter().any(|net| net.contains(&ip))
    }

    /// True when neither list has entries
    pub fn is_empty(&self) -> bool {
        self.allowlist.is_empty() && self.blocklist.is_empty()
    }

    pub fn allowlist(&self) -> &[IpNet] {
        &self.allowlist
    }

    pub fn blocklist(&self) -> &[IpNet] {
        &self.blocklist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const NONE: &[&str] = &[];

    #[test]
    fn test_empty_filter_allows_all() {
        let filter = IpFilter::new();
        assert!(filter.is_empty());
        assert!(filter.is_allowed(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(filter.is_allowed(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_single_address_allowlist() {
        let filter = IpFilter::from_lists(&["192.168.1.100"], NONE).unwrap();

        assert!(filter.is_allowed(&"192.168.1.100".parse().unwrap()));
        assert!(!filter.is_allowed(&"192.168.1.101".parse().unwrap()));
    }

    #[test]
    fn test_cidr_allowlist() {
        let filter = IpFilter::from_lists(&["10.0.0.0/8", "2001:db8::/32"], NONE).unwrap();

        assert!(filter.is_allowed(&"10.255.255.255".parse().unwrap()));
        assert!(filter.is_allowed(&"2001:db8::1".parse().unwrap()));
        assert!(!filter.is_allowed(&"11.0.0.1".parse().unwrap()));
        assert!(!filter.is_allowed(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_block_overrides_allow() {
        let filter = IpFilter::from_lists(&["10.0.0.0/8"], &["10.1.0.0/16"]).unwrap();

        assert!(filter.is_allowed(&"10.2.0.1".parse().unwrap()));
        assert!(!filter.is_allowed(&"10.1.2.3".parse().unwrap()));
        assert!(filter.is_blocked(&"10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_blocklist_only() {
        let filter = IpFilter::from_lists(NONE, &["203.0.113.7"]).unwrap();

        assert!(!filter.is_allowed(&"203.0.113.7".parse().unwrap()));
        assert!(filter.is_allowed(&"203.0.113.8".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_addresses_match_ipv4_entries() {
        let filter = IpFilter::from_lists(NONE, &["192.0.2.0/24"]).unwrap();
        let mapped: IpAddr = "::ffff:192.0.2.10".parse().unwrap();

        assert!(filter.is_blocked(&mapped));
    }

    #[test]
    fn test_zero_prefix_matches_everything() {
        let filter = IpFilter::from_lists(&["0.0.0.0/0"], NONE).unwrap();
        assert!(filter.is_allowed(&"8.8.8.8".parse().unwrap()));
        assert!(!filter.is_allowed(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_blank_entries_are_skipped() {
        let filter = IpFilter::from_lists(&["", "  "], NONE).unwrap();
        assert!(filter.is_empty());
    }

    #[test]
    fn test_invalid_entries() {
        assert_eq!(
            IpFilter::from_lists(&["not-an-ip"], NONE),
            Err(IpFilterError::InvalidIpAddress("not-an-ip".to_string()))
        );
        assert_eq!(
            IpFilter::from_lists(NONE, &["10.0.0.0/33"]),
            Err(IpFilterError::InvalidCidr("10.0.0.0/33".to_string()))
        );
        assert!(IpFilter::from_lists(&["300.0.0.1"], NONE).is_err());
    }
}
