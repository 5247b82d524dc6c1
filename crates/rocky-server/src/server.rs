//! Relay server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rocky_control::{spawn_reaper, ControlSession, HandshakeConfig, SessionRegistry, TunnelIntake};
use rocky_proto::AccessPolicy;
use rocky_transport::{EndpointConfig, EndpointListener, RelayStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::public::{admit, PublicListener};
use crate::{RelayServerConfig, ServerError};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Relay server with its bound listeners
pub struct RelayServer {
    config: RelayServerConfig,
    policy: Arc<AccessPolicy>,
    registry: Arc<SessionRegistry<RelayStream>>,
    public: Option<Arc<PublicListener>>,
    control: Option<EndpointListener>,
    tunnel: Option<EndpointListener>,
}

impl RelayServer {
    /// Bind all three endpoints
    ///
    /// An endpoint that fails to bind is logged and skipped; only when none of
    /// them binds is an error returned.
    pub async fn bind(config: RelayServerConfig) -> Result<Self, ServerError> {
        let policy = Arc::new(config.policy.clone());

        if policy.filter().is_empty() {
            warn!("⚠️  No IP restrictions - allowing ALL addresses");
        }

        let public = bind_endpoint("public", &config.public)
            .await
            .map(|listener| Arc::new(PublicListener::new(listener, policy.clone())));
        let control = bind_endpoint("control", &config.control).await;
        let tunnel = bind_endpoint("tunnel", &config.tunnel).await;

        if public.is_none() && control.is_none() && tunnel.is_none() {
            return Err(ServerError::NoListeners);
        }

        Ok(Self {
            config,
            policy,
            registry: Arc::new(SessionRegistry::new()),
            public,
            control,
            tunnel,
        })
    }

    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.public.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.tunnel.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Tunnel connections waiting to be claimed
    pub fn registry(&self) -> Arc<SessionRegistry<RelayStream>> {
        self.registry.clone()
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let mut loops = JoinSet::new();

        let reaper = self.config.unclaimed_ttl.map(|ttl| {
            spawn_reaper(
                self.registry.clone(),
                ttl,
                self.config.reap_interval,
                shutdown.clone(),
            )
        });

        match self.tunnel {
            Some(listener) => {
                let intake = TunnelIntake::new(self.registry.clone())
                    .with_preamble_timeout(self.config.preamble_timeout);
                loops.spawn(accept_tunnels(
                    listener,
                    intake,
                    self.policy.clone(),
                    shutdown.clone(),
                ));
            }
            None => warn!("⚠️  Tunnel listener unavailable - sessions cannot be paired"),
        }

        match (self.control, self.public) {
            (Some(listener), Some(public)) => {
                loops.spawn(accept_control(
                    listener,
                    public,
                    self.registry.clone(),
                    self.policy.clone(),
                    self.config.handshake,
                    shutdown.clone(),
                ));
            }
            (Some(_), None) => {
                warn!("⚠️  Public listener unavailable - not accepting control connections")
            }
            (None, _) => warn!("⚠️  Control listener unavailable - public connections will queue"),
        }

        info!("✅ Relay server running");
        shutdown.cancelled().await;
        info!("Shutting down relay server");

        while loops.join_next().await.is_some() {}
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        Ok(())
    }
}

async fn bind_endpoint(name: &'static str, config: &EndpointConfig) -> Option<EndpointListener> {
    match EndpointListener::bind(name, config).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            error!(endpoint = name, "❌ {}", e);
            None
        }
    }
}

async fn accept_control(
    listener: EndpointListener,
    public: Arc<PublicListener>,
    registry: Arc<SessionRegistry<RelayStream>>,
    policy: Arc<AccessPolicy>,
    handshake: HandshakeConfig,
    shutdown: CancellationToken,
) {
    let upgrader = listener.upgrader();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(endpoint = "control", "Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        if !admit(&policy, "control", &peer) {
            continue;
        }

        let upgrader = upgrader.clone();
        let public = public.clone();
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stream = match upgrader.upgrade(stream, peer).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(endpoint = "control", peer = %peer, "Rejected connection: {}", e);
                    return;
                }
            };

            ControlSession::new(stream, peer, public, registry, handshake, &shutdown)
                .run()
                .await;
        });
    }

    debug!("Control accept loop stopped");
}

async fn accept_tunnels(
    listener: EndpointListener,
    intake: TunnelIntake<RelayStream>,
    policy: Arc<AccessPolicy>,
    shutdown: CancellationToken,
) {
    let upgrader = listener.upgrader();

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(endpoint = "tunnel", "Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        if !admit(&policy, "tunnel", &peer) {
            continue;
        }

        let upgrader = upgrader.clone();
        let intake = intake.clone();
        tokio::spawn(async move {
            let stream = match upgrader.upgrade(stream, peer).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(endpoint = "tunnel", peer = %peer, "Rejected connection: {}", e);
                    return;
                }
            };

            if let Err(e) = intake.admit(stream, peer).await {
                warn!(endpoint = "tunnel", peer = %peer, "Dropped tunnel connection: {}", e);
            }
        });
    }

    debug!("Tunnel accept loop stopped");
}
