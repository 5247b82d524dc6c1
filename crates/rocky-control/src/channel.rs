//! Relay side of a client control connection
//!
//! The connection is split in two. The write half sits behind a mutex that a
//! handshake holds from its notice write until its echo arrives. The read half
//! is owned by a [`ControlWatcher`] for the whole life of the session, so a
//! client that hangs up or misbehaves between handshakes ends its session
//! immediately instead of on the next notice.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rocky_proto::{ControlCodec, ControlCommand, Echo, SessionId};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::{HandshakeError, HandshakeState};

/// Bound on flushing and shutting down the write half when a session ends
const CLOSE_GRACE: Duration = Duration::from_millis(250);

type EchoSlot = oneshot::Sender<Echo>;

/// Split `control` into the shared writer and the session's watcher
pub(crate) fn split_control<C>(control: C, peer: SocketAddr) -> (ControlWriter<C>, ControlWatcher<C>)
where
    C: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(control);
    let (waiters_tx, waiters_rx) = mpsc::unbounded_channel();

    let writer = ControlWriter {
        sink: Mutex::new(FramedWrite::new(write, ControlCodec::new())),
        waiters: waiters_tx,
    };
    let watcher = ControlWatcher {
        peer,
        stream: FramedRead::new(read, ControlCodec::new()),
        waiters: waiters_rx,
    };
    (writer, watcher)
}

pub(crate) struct ControlWriter<C> {
    sink: Mutex<FramedWrite<WriteHalf<C>, ControlCodec>>,
    waiters: mpsc::UnboundedSender<EchoSlot>,
}

impl<C> ControlWriter<C>
where
    C: AsyncRead + AsyncWrite,
{
    /// Send the notice for `session_id` and check the client's echo
    ///
    /// The writer stays locked for the whole exchange, so echoes arrive in
    /// the order the notices were written.
    pub(crate) async fn exchange(
        &self,
        session_id: SessionId,
        confirm_timeout: Option<Duration>,
        state: &mut HandshakeState,
    ) -> Result<(), HandshakeError> {
        let mut sink = self.sink.lock().await;

        // Registered before the notice goes out so the echo always has a taker
        let (slot, echo) = oneshot::channel();
        self.waiters
            .send(slot)
            .map_err(|_| HandshakeError::ControlSessionEnded)?;

        *state = HandshakeState::IdIssued;
        sink.send(ControlCommand::NewSession(session_id))
            .await
            .map_err(HandshakeError::ControlWrite)?;

        *state = HandshakeState::AwaitingConfirm;
        debug!(session_id = %session_id, "Session id issued");

        let echo = match confirm_timeout {
            Some(limit) => tokio::time::timeout(limit, echo)
                .await
                .map_err(|_| HandshakeError::ConfirmTimeout(limit))?,
            None => echo.await,
        }
        .map_err(|_| HandshakeError::ControlClosed)?;

        if !echo.matches(&session_id) {
            return Err(HandshakeError::EchoMismatch {
                expected: session_id,
                received: echo.to_string_lossy(),
            });
        }
        Ok(())
    }

    /// Flush and shut down the write half so the client sees end-of-stream
    pub(crate) async fn close(&self) {
        let closed = tokio::time::timeout(CLOSE_GRACE, async {
            self.sink.lock().await.close().await
        })
        .await;
        if let Ok(Err(e)) = closed {
            debug!("Failed to close control connection: {}", e);
        }
    }
}

/// Reads the control stream for the lifetime of a session
pub(crate) struct ControlWatcher<C> {
    peer: SocketAddr,
    stream: FramedRead<ReadHalf<C>, ControlCodec>,
    waiters: mpsc::UnboundedReceiver<EchoSlot>,
}

impl<C> ControlWatcher<C>
where
    C: AsyncRead + AsyncWrite,
{
    /// Deliver echoes to the handshake waiting for them
    ///
    /// Returns `Ok` when the client closes the connection cleanly. Read errors
    /// and echoes nobody is waiting for end the watch with an error. Either
    /// way any waiting handshake sees the control connection as closed.
    pub(crate) async fn run(mut self) -> Result<(), HandshakeError> {
        let mut waiting: Option<EchoSlot> = None;

        loop {
            tokio::select! {
                // A slot is always queued before its notice is written
                biased;
                slot = self.waiters.recv() => match slot {
                    Some(slot) => waiting = Some(slot),
                    None => return Ok(()),
                },
                frame = self.stream.next() => match frame {
                    Some(Ok(echo)) => match waiting.take() {
                        Some(slot) => {
                            // The handshake may have given up already
                            let _ = slot.send(echo);
                        }
                        None => return Err(HandshakeError::UnexpectedEcho(echo.to_string_lossy())),
                    },
                    Some(Err(e)) => return Err(HandshakeError::ControlRead(e)),
                    None => {
                        debug!(peer = %self.peer, "Client closed control connection");
                        return Ok(());
                    }
                },
            }
        }
    }
}
