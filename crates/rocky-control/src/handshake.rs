//! Pairing of one public connection with its tunnel connection
//!
//! The coordinator for a public connection runs through
//! `Accepted -> IdIssued -> AwaitingConfirm -> AwaitingTunnel -> Bound`, or
//! ends in `Failed`:
//!
//! 1. Take the control writer lock, write the session notice, wait for the
//!    echo and release the lock. Only this exchange is serialized per control
//!    session, so several handshakes may wait for their tunnels at once.
//! 2. Claim the tunnel connection from the registry, waiting up to the
//!    configured tunnel wait.
//! 3. Let go of the control connection and hand both connections to the relay.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rocky_proto::SessionId;
use rocky_relay::DuplexRelay;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ControlWriter;
use crate::{HandshakeError, SessionRegistry};

/// Default time a confirmed handshake waits for its tunnel connection
pub const DEFAULT_TUNNEL_WAIT: Duration = Duration::from_secs(1);

/// Handshake timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// How long to wait for the tunnel connection after the echo
    pub tunnel_wait: Duration,
    /// Bound on the echo read; `None` waits as long as the control stream is open
    pub confirm_timeout: Option<Duration>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            tunnel_wait: DEFAULT_TUNNEL_WAIT,
            confirm_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Accepted,
    IdIssued,
    AwaitingConfirm,
    AwaitingTunnel,
    Bound,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Accepted => "accepted",
            HandshakeState::IdIssued => "id_issued",
            HandshakeState::AwaitingConfirm => "awaiting_confirm",
            HandshakeState::AwaitingTunnel => "awaiting_tunnel",
            HandshakeState::Bound => "bound",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub(crate) struct Coordinator<C, T> {
    pub(crate) control: Arc<ControlWriter<C>>,
    pub(crate) registry: Arc<SessionRegistry<T>>,
    pub(crate) config: HandshakeConfig,
    pub(crate) control_closed: CancellationToken,
    pub(crate) control_peer: SocketAddr,
}

impl<C, T> Coordinator<C, T>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    /// Pair `public` with its tunnel and relay until the pair closes
    ///
    /// Returns the final state. On failure `public` is dropped, which closes it.
    pub(crate) async fn run<P>(self, public: P, public_peer: SocketAddr) -> HandshakeState
    where
        P: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = SessionId::new();
        let mut state = HandshakeState::Accepted;

        let bound = self.bind(session_id, &mut state).await;

        // A relaying pair must not keep the control connection open
        let Coordinator {
            control,
            control_closed,
            control_peer,
            ..
        } = self;
        drop(control);

        match bound {
            Ok(tunnel) => {
                state = HandshakeState::Bound;
                info!(
                    session_id = %session_id,
                    public_peer = %public_peer,
                    control_peer = %control_peer,
                    "Session bound"
                );

                let stats = DuplexRelay::spawn(session_id, public, tunnel).join().await;
                info!(
                    session_id = %session_id,
                    bytes_to_tunnel = stats.to_tunnel,
                    bytes_to_public = stats.to_public,
                    "Session closed"
                );
            }
            Err(e) => {
                if e.is_fatal_to_control() {
                    warn!(
                        session_id = %session_id,
                        public_peer = %public_peer,
                        control_peer = %control_peer,
                        state = %state,
                        "⚠️ Handshake failed, closing control session: {}",
                        e
                    );
                    control_closed.cancel();
                } else {
                    warn!(
                        session_id = %session_id,
                        public_peer = %public_peer,
                        state = %state,
                        "Handshake failed: {}",
                        e
                    );
                }
                state = HandshakeState::Failed;
                drop(public);
            }
        }

        state
    }

    async fn bind(&self, session_id: SessionId, state: &mut HandshakeState) -> Result<T, HandshakeError> {
        tokio::select! {
            _ = self.control_closed.cancelled() => return Err(HandshakeError::ControlSessionEnded),
            exchanged = self.control.exchange(session_id, self.config.confirm_timeout, state) => exchanged?,
        }

        *state = HandshakeState::AwaitingTunnel;
        debug!(session_id = %session_id, "Session id confirmed, waiting for tunnel connection");

        tokio::select! {
            _ = self.control_closed.cancelled() => Err(HandshakeError::ControlSessionEnded),
            claimed = self.registry.claim(&session_id, self.config.tunnel_wait) => {
                claimed.ok_or(HandshakeError::TunnelTimeout {
                    session_id,
                    waited: self.config.tunnel_wait,
                })
            }
        }
    }
}
