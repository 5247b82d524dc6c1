//! Admission of tunnel connections
//!
//! A tunnel connection opens with the 36-byte id of the session it serves.
//! Once the preamble is read the connection is parked in the
//! [`SessionRegistry`] and nothing else is read from it until it is paired.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rocky_proto::{read_session_preamble, SessionId};
use tokio::io::AsyncRead;
use tracing::debug;

use crate::{IntakeError, SessionRegistry};

/// Default bound on how long a tunnel connection may take to send its preamble
pub const DEFAULT_PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads tunnel preambles and parks the connections
pub struct TunnelIntake<T> {
    registry: Arc<SessionRegistry<T>>,
    preamble_timeout: Option<Duration>,
}

impl<T> Clone for TunnelIntake<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            preamble_timeout: self.preamble_timeout,
        }
    }
}

impl<T> TunnelIntake<T>
where
    T: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(registry: Arc<SessionRegistry<T>>) -> Self {
        Self {
            registry,
            preamble_timeout: Some(DEFAULT_PREAMBLE_TIMEOUT),
        }
    }

    /// Bound the preamble read; `None` waits forever
    pub fn with_preamble_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.preamble_timeout = timeout;
        self
    }

    /// Read the preamble from `stream` and register it
    ///
    /// On error the stream is dropped, which closes it.
    pub async fn admit(&self, mut stream: T, peer: SocketAddr) -> Result<SessionId, IntakeError> {
        let session_id = match self.preamble_timeout {
            Some(limit) => tokio::time::timeout(limit, read_session_preamble(&mut stream))
                .await
                .map_err(|_| IntakeError::PreambleTimeout(limit))??,
            None => read_session_preamble(&mut stream).await?,
        };

        debug!(session_id = %session_id, peer = %peer, "Tunnel connection announced session");
        self.registry.put(session_id, stream);
        Ok(session_id)
    }
}
