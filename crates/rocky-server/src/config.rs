//! Relay server configuration
//!
//! [`RelaySettings`] is the loosely typed form read from a YAML file or the
//! command line; every field is optional so a file and CLI flags can be layered.
//! [`RelaySettings::resolve`] validates it into a [`RelayServerConfig`].
//!
//! ```yaml
//! public_addr: 0.0.0.0:8099
//! control_addr: 0.0.0.0:9999
//! tunnel_addr: 0.0.0.0:9998
//! public_cert: /etc/rocky/public.crt
//! public_key: /etc/rocky/public.key
//! control_cert: /etc/rocky/relay.crt
//! control_key: /etc/rocky/relay.key
//! control_ca: /etc/rocky/clients-ca.crt
//! allowed_ips: [10.0.0.0/8]
//! blocked_ips: [10.13.0.0/16]
//! blocked_countries: [KP]
//! country_db: /etc/rocky/countries.csv
//! tunnel_wait_ms: 1000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rocky_control::{HandshakeConfig, DEFAULT_PREAMBLE_TIMEOUT, DEFAULT_TUNNEL_WAIT};
use rocky_proto::{AccessPolicy, CountryTable, IpFilter};
use rocky_transport::{EndpointConfig, TlsSettings};
use serde::Deserialize;
use tracing::info;

use crate::ServerError;

pub const DEFAULT_PUBLIC_ADDR: &str = "0.0.0.0:8099";
pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:9999";
pub const DEFAULT_TUNNEL_ADDR: &str = "0.0.0.0:9998";

/// Default age after which an unclaimed tunnel connection is evicted
pub const DEFAULT_UNCLAIMED_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Validated relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub public: EndpointConfig,
    pub control: EndpointConfig,
    pub tunnel: EndpointConfig,
    /// Applied to every accepted connection on all three endpoints
    pub policy: AccessPolicy,
    pub handshake: HandshakeConfig,
    /// `None` waits for a tunnel preamble forever
    pub preamble_timeout: Option<Duration>,
    /// `None` keeps unclaimed tunnel connections until their client closes them
    pub unclaimed_ttl: Option<Duration>,
    pub reap_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            public: EndpointConfig::plain(default_addr(DEFAULT_PUBLIC_ADDR)),
            control: EndpointConfig::plain(default_addr(DEFAULT_CONTROL_ADDR)),
            tunnel: EndpointConfig::plain(default_addr(DEFAULT_TUNNEL_ADDR)),
            policy: AccessPolicy::allow_all(),
            handshake: HandshakeConfig::default(),
            preamble_timeout: Some(DEFAULT_PREAMBLE_TIMEOUT),
            unclaimed_ttl: Some(DEFAULT_UNCLAIMED_TTL),
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

fn default_addr(addr: &str) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}

/// Raw relay settings from a config file or the command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySettings {
    pub public_addr: Option<SocketAddr>,
    pub control_addr: Option<SocketAddr>,
    pub tunnel_addr: Option<SocketAddr>,

    /// TLS certificate for the public endpoint
    pub public_cert: Option<PathBuf>,
    pub public_key: Option<PathBuf>,

    /// Mutual TLS material shared by the control and tunnel endpoints
    pub control_cert: Option<PathBuf>,
    pub control_key: Option<PathBuf>,
    pub control_ca: Option<PathBuf>,

    pub allowed_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub blocked_countries: Vec<String>,
    /// `cidr,country` CSV used to resolve `blocked_countries`
    pub country_db: Option<PathBuf>,

    pub tunnel_wait_ms: Option<u64>,
    /// 0 disables the echo timeout
    pub confirm_timeout_ms: Option<u64>,
    /// 0 disables the preamble timeout
    pub preamble_timeout_ms: Option<u64>,
    /// 0 disables eviction of unclaimed tunnel connections
    pub unclaimed_ttl_secs: Option<u64>,
    pub reap_interval_secs: Option<u64>,
}

impl RelaySettings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml(&content)?;
        info!("Loaded relay settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ServerError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Layer `overrides` on top of `self`; set fields and non-empty lists win
    pub fn overlay(self, overrides: RelaySettings) -> Self {
        fn list(base: Vec<String>, over: Vec<String>) -> Vec<String> {
            if over.is_empty() {
                base
            } else {
                over
            }
        }

        Self {
            public_addr: overrides.public_addr.or(self.public_addr),
            control_addr: overrides.control_addr.or(self.control_addr),
            tunnel_addr: overrides.tunnel_addr.or(self.tunnel_addr),
            public_cert: overrides.public_cert.or(self.public_cert),
            public_key: overrides.public_key.or(self.public_key),
            control_cert: overrides.control_cert.or(self.control_cert),
            control_key: overrides.control_key.or(self.control_key),
            control_ca: overrides.control_ca.or(self.control_ca),
            allowed_ips: list(self.allowed_ips, overrides.allowed_ips),
            blocked_ips: list(self.blocked_ips, overrides.blocked_ips),
            blocked_countries: list(self.blocked_countries, overrides.blocked_countries),
            country_db: overrides.country_db.or(self.country_db),
            tunnel_wait_ms: overrides.tunnel_wait_ms.or(self.tunnel_wait_ms),
            confirm_timeout_ms: overrides.confirm_timeout_ms.or(self.confirm_timeout_ms),
            preamble_timeout_ms: overrides.preamble_timeout_ms.or(self.preamble_timeout_ms),
            unclaimed_ttl_secs: overrides.unclaimed_ttl_secs.or(self.unclaimed_ttl_secs),
            reap_interval_secs: overrides.reap_interval_secs.or(self.reap_interval_secs),
        }
    }

    /// Validate the settings and load policy data
    pub fn resolve(self) -> Result<RelayServerConfig, ServerError> {
        let defaults = RelayServerConfig::default();

        let public_tls = match (self.public_cert, self.public_key) {
            (Some(cert_path), Some(key_path)) => TlsSettings::Server {
                cert_path,
                key_path,
            },
            (None, None) => TlsSettings::Disabled,
            _ => {
                return Err(ServerError::Config(
                    "public TLS needs both a certificate and a key".to_string(),
                ))
            }
        };

        let channel_tls = match (self.control_cert, self.control_key, self.control_ca) {
            (Some(cert_path), Some(key_path), Some(ca_path)) => TlsSettings::Mutual {
                cert_path,
                key_path,
                ca_path,
            },
            (None, None, None) => TlsSettings::Disabled,
            _ => {
                return Err(ServerError::Config(
                    "mutual TLS on the control and tunnel ports needs a certificate, a key and a client CA"
                        .to_string(),
                ))
            }
        };

        let filter = IpFilter::from_lists(&self.allowed_ips, &self.blocked_ips)?;
        let mut policy = AccessPolicy::new(filter);
        if !self.blocked_countries.is_empty() {
            let path = self.country_db.ok_or_else(|| {
                ServerError::Config("blocked countries require a country database".to_string())
            })?;
            let table = CountryTable::load(&path)?;
            policy = policy.with_blocked_countries(&self.blocked_countries, Arc::new(table));
        }

        let reap_interval = match self.reap_interval_secs {
            Some(0) => {
                return Err(ServerError::Config(
                    "reap interval must be at least one second".to_string(),
                ))
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.reap_interval,
        };

        Ok(RelayServerConfig {
            public: EndpointConfig::plain(self.public_addr.unwrap_or(defaults.public.bind_addr))
                .with_tls(public_tls),
            control: EndpointConfig::plain(self.control_addr.unwrap_or(defaults.control.bind_addr))
                .with_tls(channel_tls.clone()),
            tunnel: EndpointConfig::plain(self.tunnel_addr.unwrap_or(defaults.tunnel.bind_addr))
                .with_tls(channel_tls),
            policy,
            handshake: HandshakeConfig {
                tunnel_wait: self
                    .tunnel_wait_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_TUNNEL_WAIT),
                confirm_timeout: optional_millis(self.confirm_timeout_ms, None),
            },
            preamble_timeout: optional_millis(self.preamble_timeout_ms, defaults.preamble_timeout),
            unclaimed_ttl: match self.unclaimed_ttl_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.unclaimed_ttl,
            },
            reap_interval,
        })
    }
}

fn optional_millis(value: Option<u64>, default: Option<Duration>) -> Option<Duration> {
    match value {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelaySettings::default().resolve().unwrap();

        assert_eq!(config.public.bind_addr, "0.0.0.0:8099".parse().unwrap());
        assert_eq!(config.control.bind_addr, "0.0.0.0:9999".parse().unwrap());
        assert_eq!(config.tunnel.bind_addr, "0.0.0.0:9998".parse().unwrap());
        assert!(!config.public.tls.is_enabled());
        assert!(!config.control.tls.is_enabled());
        assert_eq!(config.handshake.tunnel_wait, Duration::from_secs(1));
        assert_eq!(config.handshake.confirm_timeout, None);
        assert_eq!(config.preamble_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.unclaimed_ttl, Some(Duration::from_secs(30)));
        assert_eq!(config.reap_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_yaml_settings() {
        let yaml = r#"
public_addr: 127.0.0.1:18099
control_cert: relay.crt
control_key: relay.key
control_ca: ca.crt
allowed_ips:
  - 10.0.0.0/8
blocked_ips: ["10.13.0.0/16"]
tunnel_wait_ms: 2500
confirm_timeout_ms: 5000
preamble_timeout_ms: 0
unclaimed_ttl_secs: 0
"#;
        let config = RelaySettings::from_yaml(yaml).unwrap().resolve().unwrap();

        assert_eq!(config.public.bind_addr, "127.0.0.1:18099".parse().unwrap());
        assert_eq!(
            config.control.tls,
            TlsSettings::Mutual {
                cert_path: "relay.crt".into(),
                key_path: "relay.key".into(),
                ca_path: "ca.crt".into(),
            }
        );
        assert_eq!(config.tunnel.tls, config.control.tls);
        assert_eq!(config.handshake.tunnel_wait, Duration::from_millis(2500));
        assert_eq!(config.handshake.confirm_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.preamble_timeout, None);
        assert_eq!(config.unclaimed_ttl, None);
        assert!(!config.policy.is_allowed(&"10.13.0.1:1".parse().unwrap()));
        assert!(config.policy.is_allowed(&"10.14.0.1:1".parse().unwrap()));
        assert!(!config.policy.is_allowed(&"192.168.0.1:1".parse().unwrap()));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(RelaySettings::from_yaml("proxy_port: 8099\n").is_err());
    }

    #[test]
    fn test_empty_file() {
        assert_eq!(RelaySettings::from_yaml("\n").unwrap(), RelaySettings::default());
    }

    #[test]
    fn test_overlay() {
        let file = RelaySettings {
            public_addr: Some("127.0.0.1:1000".parse().unwrap()),
            control_addr: Some("127.0.0.1:2000".parse().unwrap()),
            blocked_ips: vec!["192.0.2.1".to_string()],
            tunnel_wait_ms: Some(500),
            ..Default::default()
        };
        let cli = RelaySettings {
            control_addr: Some("127.0.0.1:3000".parse().unwrap()),
            allowed_ips: vec!["10.0.0.0/8".to_string()],
            ..Default::default()
        };

        let merged = file.overlay(cli);
        assert_eq!(merged.public_addr, Some("127.0.0.1:1000".parse().unwrap()));
        assert_eq!(merged.control_addr, Some("127.0.0.1:3000".parse().unwrap()));
        assert_eq!(merged.blocked_ips, vec!["192.0.2.1".to_string()]);
        assert_eq!(merged.allowed_ips, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(merged.tunnel_wait_ms, Some(500));
    }

    #[test]
    fn test_partial_tls_is_rejected() {
        let public_only_cert = RelaySettings {
            public_cert: Some("public.crt".into()),
            ..Default::default()
        };
        assert!(matches!(public_only_cert.resolve(), Err(ServerError::Config(_))));

        let missing_ca = RelaySettings {
            control_cert: Some("relay.crt".into()),
            control_key: Some("relay.key".into()),
            ..Default::default()
        };
        assert!(matches!(missing_ca.resolve(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_invalid_ip_filter() {
        let settings = RelaySettings {
            blocked_ips: vec!["999.1.1.1".to_string()],
            ..Default::default()
        };
        assert!(matches!(settings.resolve(), Err(ServerError::IpFilter(_))));
    }

    #[test]
    fn test_blocked_countries_need_database() {
        let settings = RelaySettings {
            blocked_countries: vec!["KP".to_string()],
            ..Default::default()
        };
        assert!(matches!(settings.resolve(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_blocked_countries_with_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("countries.csv");
        std::fs::write(&db, "203.0.113.0/24,KP\n").unwrap();

        let settings = RelaySettings {
            blocked_countries: vec!["kp".to_string()],
            country_db: Some(db),
            ..Default::default()
        };
        let config = settings.resolve().unwrap();
        assert!(!config.policy.is_allowed(&"203.0.113.9:1".parse().unwrap()));
        assert!(config.policy.is_allowed(&"198.51.100.9:1".parse().unwrap()));
    }

    #[test]
    fn test_zero_reap_interval_is_rejected() {
        let settings = RelaySettings {
            reap_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(settings.resolve().is_err());
    }
}
