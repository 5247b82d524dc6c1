use std::path::PathBuf;

use rocky_proto::{CountryTableError, IpFilterError};
use rocky_transport::TransportError;
use thiserror::Error;

/// Relay server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid IP filter: {0}")]
    IpFilter(#[from] IpFilterError),

    #[error("Failed to load country table: {0}")]
    CountryTable(#[from] CountryTableError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No listener could be bound")]
    NoListeners,
}
