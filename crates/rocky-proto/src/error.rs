use thiserror::Error;

/// Errors raised while framing or parsing relay protocol data
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}
