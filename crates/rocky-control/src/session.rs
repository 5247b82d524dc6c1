//! Control sessions
//!
//! A control session owns one authenticated client control connection. While
//! it is alive it competes with the other sessions for connections on the
//! shared public endpoint and runs a handshake coordinator for each one it
//! wins. The session ends when its control connection fails or the server
//! shuts down; handshakes still pairing at that point are failed and their
//! public connections closed, while already bound pairs keep relaying.
//!
//! The control stream is read for the whole life of the session, so a client
//! that hangs up while idle is dropped before it can claim a public connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{split_control, ControlWatcher, ControlWriter};
use crate::handshake::Coordinator;
use crate::{HandshakeConfig, SessionRegistry};

/// Pause after a failed public accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of public connections shared by all control sessions
#[async_trait]
pub trait PublicEndpoint: Send + Sync + 'static {
    /// Connection as returned by `accept`, before any upgrade
    type Pending: Send + 'static;
    /// Connection ready for relaying
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Wait for the next admitted public connection
    ///
    /// Must be cancel safe; sessions race on it.
    async fn accept(&self) -> io::Result<(Self::Pending, SocketAddr)>;

    /// Finish establishing a connection, e.g. terminate TLS
    async fn establish(&self, pending: Self::Pending, peer: SocketAddr) -> io::Result<Self::Stream>;
}

pub struct ControlSession<C, E, T> {
    peer: SocketAddr,
    control: Arc<ControlWriter<C>>,
    watcher: ControlWatcher<C>,
    endpoint: Arc<E>,
    registry: Arc<SessionRegistry<T>>,
    config: HandshakeConfig,
    closed: CancellationToken,
}

impl<C, E, T> ControlSession<C, E, T>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    E: PublicEndpoint,
    T: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    /// Wrap an established control connection
    ///
    /// The session also ends when `shutdown` is cancelled.
    pub fn new(
        control: C,
        peer: SocketAddr,
        endpoint: Arc<E>,
        registry: Arc<SessionRegistry<T>>,
        config: HandshakeConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let (writer, watcher) = split_control(control, peer);
        Self {
            peer,
            control: Arc::new(writer),
            watcher,
            endpoint,
            registry,
            config,
            closed: shutdown.child_token(),
        }
    }

    /// Token cancelled once the session is over
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Serve public connections until the control connection dies
    pub async fn run(self) {
        let ControlSession {
            peer,
            control,
            watcher,
            endpoint,
            registry,
            config,
            closed,
        } = self;

        info!(peer = %peer, "Control session started");
        let mut handshakes = JoinSet::new();
        let watch = watcher.run();
        tokio::pin!(watch);

        loop {
            tokio::select! {
                biased;
                _ = closed.cancelled() => break,
                ended = &mut watch => {
                    match ended {
                        Ok(()) => debug!(peer = %peer, "Control connection closed"),
                        Err(e) => warn!(peer = %peer, "⚠️ Control connection failed: {}", e),
                    }
                    break;
                }
                Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
                accepted = endpoint.accept() => match accepted {
                    Ok((pending, public_peer)) => {
                        debug!(
                            control_peer = %peer,
                            public_peer = %public_peer,
                            "Public connection claimed by control session"
                        );
                        let endpoint = endpoint.clone();
                        let coordinator = Coordinator {
                            control: control.clone(),
                            registry: registry.clone(),
                            config,
                            control_closed: closed.clone(),
                            control_peer: peer,
                        };
                        handshakes.spawn(async move {
                            match endpoint.establish(pending, public_peer).await {
                                Ok(public) => {
                                    coordinator.run(public, public_peer).await;
                                }
                                Err(e) => {
                                    debug!(public_peer = %public_peer, "Failed to establish public connection: {}", e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(control_peer = %peer, "Failed to accept public connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        closed.cancel();
        // Bound pairs outlive the session; pending handshakes observe the token
        handshakes.detach_all();
        control.close().await;
        info!(peer = %peer, "Control session ended");
    }
}
