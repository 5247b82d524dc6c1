//! Bidirectional byte relay between a public connection and its tunnel
//!
//! A bound pair is served by two tasks, one per direction. Both share a
//! cancellation token: the first direction to hit end-of-stream or an error
//! cancels it, the other direction stops at its next await point, and both
//! connections are closed once the two tasks have dropped their halves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rocky_proto::SessionId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Size of the per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bound on the graceful shutdown of a write half during teardown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToTunnel,
    ToPublic,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::ToTunnel => "public->tunnel",
            Direction::ToPublic => "tunnel->public",
        }
    }
}

/// Bytes moved in each direction over the lifetime of a pair
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub to_tunnel: u64,
    pub to_public: u64,
}

/// Spawns relay tasks for bound pairs
pub struct DuplexRelay;

impl DuplexRelay {
    /// Start relaying between `public` and `tunnel`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<P, T>(session_id: SessionId, public: P, tunnel: T) -> RelayHandle
    where
        P: AsyncRead + AsyncWrite + Send + 'static,
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let alive = CancellationToken::new();
        let to_tunnel = Arc::new(AtomicU64::new(0));
        let to_public = Arc::new(AtomicU64::new(0));

        let (public_read, public_write) = tokio::io::split(public);
        let (tunnel_read, tunnel_write) = tokio::io::split(tunnel);

        let upstream = tokio::spawn(pump(
            Direction::ToTunnel,
            session_id,
            public_read,
            tunnel_write,
            alive.clone(),
            to_tunnel.clone(),
        ));
        let downstream = tokio::spawn(pump(
            Direction::ToPublic,
            session_id,
            tunnel_read,
            public_write,
            alive.clone(),
            to_public.clone(),
        ));

        RelayHandle {
            alive,
            to_tunnel,
            to_public,
            tasks: [upstream, downstream],
        }
    }
}

/// Handle to a running pair
///
/// Dropping the handle does not stop the relay.
pub struct RelayHandle {
    alive: CancellationToken,
    to_tunnel: Arc<AtomicU64>,
    to_public: Arc<AtomicU64>,
    tasks: [JoinHandle<()>; 2],
}

impl RelayHandle {
    /// False once either direction has stopped
    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    /// Tear the pair down; idempotent
    pub fn shutdown(&self) {
        self.alive.cancel();
    }

    /// Wait until both directions have stopped and both connections are closed
    pub async fn join(self) -> RelayStats {
        let [upstream, downstream] = self.tasks;
        let _ = tokio::join!(upstream, downstream);
        RelayStats {
            to_tunnel: self.to_tunnel.load(Ordering::Relaxed),
            to_public: self.to_public.load(Ordering::Relaxed),
        }
    }
}

async fn pump<R, W>(
    direction: Direction,
    session_id: SessionId,
    mut reader: R,
    mut writer: W,
    alive: CancellationToken,
    counter: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = alive.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(session_id = %session_id, direction = direction.as_str(), "Peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(session_id = %session_id, direction = direction.as_str(), "Read failed: {}", e);
                    break;
                }
            },
        };

        // A completed write is counted even if the pair is torn down meanwhile
        let written = tokio::select! {
            biased;
            written = writer.write_all(&buf[..n]) => written,
            _ = alive.cancelled() => break,
        };
        if let Err(e) = written {
            debug!(session_id = %session_id, direction = direction.as_str(), "Write failed: {}", e);
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    alive.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
}
