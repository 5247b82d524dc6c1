use std::time::Duration;

use rocky_proto::{ProtoError, SessionId};
use thiserror::Error;

/// Errors raised while admitting a tunnel connection
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Failed to read session preamble: {0}")]
    Preamble(#[from] ProtoError),

    #[error("No session preamble within {0:?}")]
    PreambleTimeout(Duration),
}

/// Reasons a handshake for one public connection failed
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Failed to send session notice: {0}")]
    ControlWrite(#[source] ProtoError),

    #[error("Failed to read session echo: {0}")]
    ControlRead(#[source] ProtoError),

    #[error("Control connection closed before echoing the session id")]
    ControlClosed,

    #[error("No session echo within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("Client echoed {received:?}, expected {expected}")]
    EchoMismatch {
        expected: SessionId,
        received: String,
    },

    #[error("No tunnel connection for session {session_id} within {waited:?}")]
    TunnelTimeout {
        session_id: SessionId,
        waited: Duration,
    },

    #[error("Client sent {0:?} with no session awaiting an echo")]
    UnexpectedEcho(String),

    #[error("Control session ended")]
    ControlSessionEnded,
}

impl HandshakeError {
    /// True when the control connection can no longer be used
    pub fn is_fatal_to_control(&self) -> bool {
        matches!(
            self,
            HandshakeError::ControlWrite(_)
                | HandshakeError::ControlRead(_)
                | HandshakeError::ControlClosed
                | HandshakeError::ConfirmTimeout(_)
                | HandshakeError::UnexpectedEcho(_)
        )
    }
}
