//! Listening endpoints for the relay
//!
//! Each endpoint is a TCP listener with an optional TLS layer. Accepting and
//! upgrading are split: [`EndpointListener::accept`] only returns the raw TCP
//! connection so the caller can apply its admission policy before any TLS work
//! happens, and [`StreamUpgrader::upgrade`] then terminates TLS (when configured)
//! on a separate task.

pub mod listener;
pub mod stream;
pub mod tls;

use thiserror::Error;

pub use listener::{EndpointConfig, EndpointListener, StreamUpgrader, DEFAULT_HANDSHAKE_TIMEOUT};
pub use stream::RelayStream;
pub use tls::{ensure_crypto_provider, TlsSettings};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("TLS handshake with {peer} timed out")]
    HandshakeTimeout { peer: std::net::SocketAddr },

    #[error("Failed to bind {endpoint} listener to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        endpoint: &'static str,
        address: String,
        port: u16,
        reason: String,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
