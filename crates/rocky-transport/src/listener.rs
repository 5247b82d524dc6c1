use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::{RelayStream, TlsSettings, TransportError, TransportResult};

/// Upper bound on a TLS handshake before the connection is dropped
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind address and TLS mode of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub bind_addr: SocketAddr,
    pub tls: TlsSettings,
}

impl EndpointConfig {
    pub fn plain(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            tls: TlsSettings::Disabled,
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }
}

/// TCP listener for one relay endpoint
pub struct EndpointListener {
    name: &'static str,
    listener: TcpListener,
    upgrader: StreamUpgrader,
}

impl std::fmt::Debug for EndpointListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointListener")
            .field("name", &self.name)
            .field("local_addr", &self.listener.local_addr())
            .field("tls", &self.upgrader.is_tls())
            .finish()
    }
}

impl EndpointListener {
    /// Load the TLS material and bind the listener
    pub async fn bind(name: &'static str, config: &EndpointConfig) -> TransportResult<Self> {
        let acceptor = config.tls.build_acceptor()?;

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            TransportError::BindError {
                endpoint: name,
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        let local_addr = listener.local_addr()?;
        info!(
            endpoint = name,
            addr = %local_addr,
            mode = config.tls.describe(),
            "Listener bound"
        );

        Ok(Self {
            name,
            listener,
            upgrader: StreamUpgrader::new(acceptor),
        })
    }

    /// Accept the next raw TCP connection
    ///
    /// Cancel safe; no TLS work happens here.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = self.name, peer = %peer, "Failed to set TCP_NODELAY: {}", e);
        }
        debug!(endpoint = self.name, peer = %peer, "Accepted TCP connection");
        Ok((stream, peer))
    }

    pub fn upgrader(&self) -> StreamUpgrader {
        self.upgrader.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_tls(&self) -> bool {
        self.upgrader.is_tls()
    }
}

/// Terminates TLS on accepted connections
#[derive(Clone)]
pub struct StreamUpgrader {
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl StreamUpgrader {
    pub fn new(acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            acceptor,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Run the TLS handshake, or pass the stream through for plain endpoints
    pub async fn upgrade(&self, stream: TcpStream, peer: SocketAddr) -> TransportResult<RelayStream> {
        let Some(acceptor) = &self.acceptor else {
            return Ok(RelayStream::Plain(stream));
        };

        let tls = tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout { peer })?
            .map_err(|e| TransportError::TlsError(format!("Handshake with {} failed: {}", peer, e)))?;

        debug!(peer = %peer, "TLS handshake complete");
        Ok(RelayStream::Tls(Box::new(tls)))
    }
}
