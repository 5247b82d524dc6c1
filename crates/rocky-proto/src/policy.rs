//! Admission policy applied to every accepted connection
//!
//! Combines the [`IpFilter`] with an optional country block list. Countries are
//! looked up through a [`CountryResolver`]; the bundled [`CountryTable`] reads a
//! plain `cidr,country` CSV so no external database service is required.

use std::collections::HashSet;
use std::fmt;
use std::io::BufRead;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::debug;

use crate::ip_filter::{parse_network, IpFilter, IpFilterError};

/// Maps an address to an ISO 3166 alpha-2 country code
#[cfg_attr(test, mockall::automock)]
pub trait CountryResolver: Send + Sync {
    fn country_of(&self, ip: IpAddr) -> Option<String>;
}

/// Outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Address is in the block list
    Blocked,
    /// Address is missing from a non-empty allow list
    NotAllowlisted,
    /// Address resolves to a blocked country
    BlockedCountry(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "allowed"),
            Decision::Blocked => write!(f, "address is blocked"),
            Decision::NotAllowlisted => write!(f, "address is not in the allow list"),
            Decision::BlockedCountry(country) => write!(f, "country {} is blocked", country),
        }
    }
}

/// Address and country based admission policy
#[derive(Clone, Default)]
pub struct AccessPolicy {
    filter: IpFilter,
    blocked_countries: HashSet<String>,
    resolver: Option<Arc<dyn CountryResolver>>,
}

impl AccessPolicy {
    /// Policy that admits every connection
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new(filter: IpFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Block connections whose address resolves to one of `countries`
    pub fn with_blocked_countries<I, S>(mut self, countries: I, resolver: Arc<dyn CountryResolver>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blocked_countries = countries
            .into_iter()
            .map(|c| c.as_ref().trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        self.resolver = Some(resolver);
        self
    }

    /// Evaluate the policy for a peer
    pub fn decide(&self, peer: &SocketAddr) -> Decision {
        let ip = peer.ip();

        if self.filter.is_blocked(&ip) {
            return Decision::Blocked;
        }

        if let Some(country) = self.blocked_country_of(ip) {
            return Decision::BlockedCountry(country);
        }

        if !self.filter.is_allowlisted(&ip) {
            return Decision::NotAllowlisted;
        }

        Decision::Allow
    }

    pub fn is_allowed(&self, peer: &SocketAddr) -> bool {
        self.decide(peer).is_allowed()
    }

    pub fn filter(&self) -> &IpFilter {
        &self.filter
    }

    pub fn blocked_countries(&self) -> impl Iterator<Item = &str> {
        self.blocked_countries.iter().map(String::as_str)
    }

    fn blocked_country_of(&self, ip: IpAddr) -> Option<String> {
        if self.blocked_countries.is_empty() {
            return None;
        }
        let resolver = self.resolver.as_ref()?;
        let country = resolver.country_of(ip.to_canonical())?.to_ascii_uppercase();
        self.blocked_countries.contains(&country).then_some(country)
    }
}

impl fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("filter", &self.filter)
            .field("blocked_countries", &self.blocked_countries)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// In-memory country lookup table loaded from `cidr,country` rows
///
/// Blank lines and lines starting with `#` are skipped. When ranges overlap,
/// the most specific one wins.
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
    ranges: Vec<(IpNet, String)>,
}

/// Errors raised while loading a [`CountryTable`]
#[derive(Debug, thiserror::Error)]
pub enum CountryTableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Line {line}: {source}")]
    Network {
        line: usize,
        #[source]
        source: IpFilterError,
    },
}

impl CountryTable {
    pub fn load(path: &Path) -> Result<Self, CountryTableError> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(std::io::BufReader::new(file))?;
        debug!(path = %path.display(), ranges = table.len(), "Loaded country table");
        Ok(table)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, CountryTableError> {
        let mut ranges = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = index + 1;
            let row = line.trim();
            if row.is_empty() || row.starts_with('#') {
                continue;
            }

            let (network, country) = row.split_once(',').ok_or_else(|| CountryTableError::Malformed {
                line: line_no,
                reason: "expected `cidr,country`".to_string(),
            })?;

            let country = country.trim().to_ascii_uppercase();
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(CountryTableError::Malformed {
                    line: line_no,
                    reason: format!("invalid country code {:?}", country),
                });
            }

            let network = parse_network(network).map_err(|source| CountryTableError::Network {
                line: line_no,
                source,
            })?;
            ranges.push((network, country));
        }

        Ok(Self { ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl CountryResolver for CountryTable {
    fn country_of(&self, ip: IpAddr) -> Option<String> {
        self.ranges
            .iter()
            .filter(|(network, _)| network.contains(&ip))
            .max_by_key(|(network, _)| network.prefix_len())
            .map(|(_, country)| country.clone())
    }
}
