//! The shared public endpoint

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rocky_control::PublicEndpoint;
use rocky_proto::{AccessPolicy, Decision};
use rocky_transport::{EndpointListener, RelayStream};
use tokio::net::TcpStream;
use tracing::warn;

/// Public listener shared by every control session
///
/// Connections refused by the policy are closed inside `accept` and never
/// reach a session.
pub struct PublicListener {
    listener: EndpointListener,
    policy: Arc<AccessPolicy>,
}

impl PublicListener {
    pub fn new(listener: EndpointListener, policy: Arc<AccessPolicy>) -> Self {
        Self { listener, policy }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl PublicEndpoint for PublicListener {
    type Pending = TcpStream;
    type Stream = RelayStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            if admit(&self.policy, self.listener.name(), &peer) {
                return Ok((stream, peer));
            }
        }
    }

    async fn establish(&self, pending: TcpStream, peer: SocketAddr) -> io::Result<RelayStream> {
        self.listener
            .upgrader()
            .upgrade(pending, peer)
            .await
            .map_err(io::Error::other)
    }
}

/// Apply the access policy, logging refusals
pub(crate) fn admit(policy: &AccessPolicy, endpoint: &'static str, peer: &SocketAddr) -> bool {
    match policy.decide(peer) {
        Decision::Allow => true,
        decision => {
            warn!(endpoint, peer = %peer, "Connection refused: {}", decision);
            false
        }
    }
}
