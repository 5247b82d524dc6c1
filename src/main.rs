//! Rocky relay server CLI
//!
//! Accepts public connections and hands each one to a connected client,
//! which answers with a tunnel connection that is relayed byte for byte.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rocky_server::{RelayServer, RelayServerConfig, RelaySettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("ROCKY_GIT_HASH"),
    " ",
    env!("ROCKY_BUILD_TIME"),
    ")"
);

/// Rocky - reverse tunnel relay
#[derive(Parser, Debug)]
#[command(name = "rocky")]
#[command(about = "Rocky - expose services behind NAT through a public relay")]
#[command(version, long_version = LONG_VERSION)]
#[command(long_about = r#"
Rocky listens on three ports. Public clients connect to the public port.
For each of them a "New" notice carrying a session id is sent to a client
on the control port, which opens a tunnel connection to the tunnel port
starting with that id and echoes the id back on its control connection.
The public and tunnel connections are then relayed to each other.

EXAMPLES:
  # Plain relay on the default ports
  rocky

  # Mutual TLS between the relay and its clients, restricted public access
  rocky --control-cert relay.crt --control-key relay.key --control-ca clients-ca.crt \
    --allowed-ips 10.0.0.0/8,192.168.0.0/16

  # Settings from a file, with a command line override
  rocky --config /etc/rocky/relay.yaml --tunnel-wait-ms 2000

ENVIRONMENT VARIABLES:
  Every option can also be set through ROCKY_<OPTION>, e.g. ROCKY_PUBLIC_ADDR.
    "#)]
struct Cli {
    /// YAML settings file; command line options take precedence
    #[arg(short, long, env = "ROCKY_CONFIG")]
    config: Option<PathBuf>,

    /// Address for public connections [default: 0.0.0.0:8099]
    #[arg(long, env = "ROCKY_PUBLIC_ADDR")]
    public_addr: Option<SocketAddr>,

    /// Address for control connections [default: 0.0.0.0:9999]
    #[arg(long, env = "ROCKY_CONTROL_ADDR")]
    control_addr: Option<SocketAddr>,

    /// Address for tunnel connections [default: 0.0.0.0:9998]
    #[arg(long, env = "ROCKY_TUNNEL_ADDR")]
    tunnel_addr: Option<SocketAddr>,

    /// TLS certificate for the public port
    #[arg(long, env = "ROCKY_PUBLIC_CERT")]
    public_cert: Option<PathBuf>,

    /// TLS key for the public port
    #[arg(long, env = "ROCKY_PUBLIC_KEY")]
    public_key: Option<PathBuf>,

    /// Server certificate for the control and tunnel ports
    #[arg(long, env = "ROCKY_CONTROL_CERT")]
    control_cert: Option<PathBuf>,

    /// Server key for the control and tunnel ports
    #[arg(long, env = "ROCKY_CONTROL_KEY")]
    control_key: Option<PathBuf>,

    /// CA that client certificates on the control and tunnel ports must chain to
    #[arg(long, env = "ROCKY_CONTROL_CA")]
    control_ca: Option<PathBuf>,

    /// Only accept connections from these addresses or CIDR ranges
    #[arg(long, env = "ROCKY_ALLOWED_IPS", value_delimiter = ',', value_name = "CIDR")]
    allowed_ips: Vec<String>,

    /// Refuse connections from these addresses or CIDR ranges
    #[arg(long, env = "ROCKY_BLOCKED_IPS", value_delimiter = ',', value_name = "CIDR")]
    blocked_ips: Vec<String>,

    /// Refuse connections from these country codes (needs --country-db)
    #[arg(long, env = "ROCKY_BLOCKED_COUNTRIES", value_delimiter = ',', value_name = "CODE")]
    blocked_countries: Vec<String>,

    /// CSV of `cidr,country` rows used for country blocking
    #[arg(long, env = "ROCKY_COUNTRY_DB")]
    country_db: Option<PathBuf>,

    /// How long a confirmed session waits for its tunnel connection
    #[arg(long, env = "ROCKY_TUNNEL_WAIT_MS")]
    tunnel_wait_ms: Option<u64>,

    /// How long to wait for the client's echo (0 = forever)
    #[arg(long, env = "ROCKY_CONFIRM_TIMEOUT_MS")]
    confirm_timeout_ms: Option<u64>,

    /// How long a tunnel connection may take to send its session id (0 = forever)
    #[arg(long, env = "ROCKY_PREAMBLE_TIMEOUT_MS")]
    preamble_timeout_ms: Option<u64>,

    /// Evict tunnel connections nobody claimed after this many seconds (0 = never)
    #[arg(long, env = "ROCKY_UNCLAIMED_TTL_SECS")]
    unclaimed_ttl_secs: Option<u64>,

    /// How often unclaimed tunnel connections are checked
    #[arg(long, env = "ROCKY_REAP_INTERVAL_SECS")]
    reap_interval_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn settings(&self) -> RelaySettings {
        RelaySettings {
            public_addr: self.public_addr,
            control_addr: self.control_addr,
            tunnel_addr: self.tunnel_addr,
            public_cert: self.public_cert.clone(),
            public_key: self.public_key.clone(),
            control_cert: self.control_cert.clone(),
            control_key: self.control_key.clone(),
            control_ca: self.control_ca.clone(),
            allowed_ips: self.allowed_ips.clone(),
            blocked_ips: self.blocked_ips.clone(),
            blocked_countries: self.blocked_countries.clone(),
            country_db: self.country_db.clone(),
            tunnel_wait_ms: self.tunnel_wait_ms,
            confirm_timeout_ms: self.confirm_timeout_ms,
            preamble_timeout_ms: self.preamble_timeout_ms,
            unclaimed_ttl_secs: self.unclaimed_ttl_secs,
            reap_interval_secs: self.reap_interval_secs,
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let default = if verbose {
        "rocky=debug,rocky_server=debug,rocky_control=debug,rocky_relay=debug,rocky_transport=debug,rocky_proto=debug"
    } else {
        "rocky=info,rocky_server=info,rocky_control=info,rocky_relay=info,rocky_transport=info,rocky_proto=info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn log_configuration(config: &RelayServerConfig) {
    info!("🚀 Starting Rocky relay {}", LONG_VERSION);
    info!("Public:  {} ({})", config.public.bind_addr, config.public.tls.describe());
    info!("Control: {} ({})", config.control.bind_addr, config.control.tls.describe());
    info!("Tunnel:  {} ({})", config.tunnel.bind_addr, config.tunnel.tls.describe());

    if !config.control.tls.is_enabled() {
        warn!("⚠️  Control and tunnel ports are unencrypted - any client may pair with public connections");
    }

    let filter = config.policy.filter();
    if !filter.allowlist().is_empty() {
        info!("Allowed networks:");
        for net in filter.allowlist() {
            info!("  - {}", net);
        }
    }
    if !filter.blocklist().is_empty() {
        info!("Blocked networks:");
        for net in filter.blocklist() {
            info!("  - {}", net);
        }
    }
    let countries: Vec<&str> = config.policy.blocked_countries().collect();
    if !countries.is_empty() {
        info!("Blocked countries: {}", countries.join(", "));
    }

    info!("Tunnel wait: {:?}", config.handshake.tunnel_wait);
    match config.handshake.confirm_timeout {
        Some(timeout) => info!("Echo timeout: {:?}", timeout),
        None => info!("Echo timeout: none"),
    }
    match config.unclaimed_ttl {
        Some(ttl) => info!("Unclaimed tunnels evicted after {:?}", ttl),
        None => warn!("⚠️  Unclaimed tunnel connections are never evicted"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let file_settings = match &cli.config {
        Some(path) => RelaySettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => RelaySettings::default(),
    };
    let config = file_settings
        .overlay(cli.settings())
        .resolve()
        .context("Invalid relay configuration")?;

    log_configuration(&config);

    let server = RelayServer::bind(config)
        .await
        .context("Failed to start relay server")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down...");
        signal.cancel();
    });

    server.run(shutdown).await?;

    info!("✅ Relay server stopped");
    Ok(())
}
