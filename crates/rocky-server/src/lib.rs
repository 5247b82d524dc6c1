//! Reverse-tunnel relay server
//!
//! Wires the three listening endpoints to the session machinery:
//!
//! - **public** (default `:8099`): third-party traffic, optionally TLS
//! - **control** (default `:9999`): long-lived client control connections
//! - **tunnel** (default `:9998`): per-session data connections opened by clients
//!
//! Control and tunnel endpoints share one optional mutual TLS configuration.

pub mod config;
pub mod error;
pub mod public;
pub mod server;

pub use config::{RelayServerConfig, RelaySettings};
pub use error::ServerError;
pub use public::PublicListener;
pub use server::RelayServer;
