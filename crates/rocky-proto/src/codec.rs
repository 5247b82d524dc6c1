//! Control stream and tunnel preamble framing
//!
//! The control stream is line oriented. For every new public connection the
//! relay writes:
//!
//! ```text
//! New\n
//! <session-id>\n
//! ```
//!
//! and the client answers with the same id (exactly 36 bytes, a trailing
//! newline is tolerated). A tunnel connection starts with the 36 id bytes and
//! carries raw payload afterwards.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtoError, SessionId, SESSION_ID_LEN};

/// Notice line announcing a new public connection
pub const NEW_SESSION_NOTICE: &str = "New";

/// Messages sent from the relay to a client over the control stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    NewSession(SessionId),
}

/// Raw id bytes echoed back by a client
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Echo([u8; SESSION_ID_LEN]);

impl Echo {
    pub fn new(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// True when the echo is byte-for-byte the canonical form of `id`
    pub fn matches(&self, id: &SessionId) -> bool {
        self.0 == id.to_wire()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl std::fmt::Debug for Echo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Echo").field(&self.to_string_lossy()).finish()
    }
}

/// Codec for the relay side of the control stream
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<ControlCommand> for ControlCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: ControlCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ControlCommand::NewSession(id) => {
                dst.reserve(NEW_SESSION_NOTICE.len() + SESSION_ID_LEN + 2);
                dst.put_slice(NEW_SESSION_NOTICE.as_bytes());
                dst.put_u8(b'\n');
                dst.put_slice(&id.to_wire());
                dst.put_u8(b'\n');
            }
        }
        Ok(())
    }
}

impl Decoder for ControlCodec {
    type Item = Echo;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Line terminators left over from the previous echo
        let terminators = src
            .iter()
            .take_while(|b| matches!(b, b'\r' | b'\n'))
            .count();
        src.advance(terminators);

        if src.len() < SESSION_ID_LEN {
            src.reserve(SESSION_ID_LEN - src.len());
            return Ok(None);
        }

        let mut bytes = [0u8; SESSION_ID_LEN];
        bytes.copy_from_slice(&src[..SESSION_ID_LEN]);
        src.advance(SESSION_ID_LEN);

        Ok(Some(Echo(bytes)))
    }
}

/// Read the session id that opens a tunnel connection
pub async fn read_session_preamble<R>(reader: &mut R) -> Result<SessionId, ProtoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; SESSION_ID_LEN];
    reader.read_exact(&mut buf).await?;
    SessionId::from_wire(&buf)
}

/// Write the session id that opens a tunnel connection
pub async fn write_session_preamble<W>(writer: &mut W, id: &SessionId) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&id.to_wire()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_encode_new_session() {
        let id = SessionId::new();
        let mut buf = BytesMut::new();

        ControlCodec
            .encode(ControlCommand::NewSession(id), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], format!("New\n{}\n", id).as_bytes());
    }

    #[test]
    fn test_decode_waits_for_full_id() {
        let id = SessionId::new();
        let wire = id.to_wire();
        let mut buf = BytesMut::from(&wire[..20]);

        assert!(ControlCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[20..]);
        let echo = ControlCodec.decode(&mut buf).unwrap().unwrap();
        assert!(echo.matches(&id));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_skips_line_terminators() {
        let first = SessionId::new();
        let second = SessionId::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("{}\n\r\n{}\n", first, second).as_bytes());

        let echo = ControlCodec.decode(&mut buf).unwrap().unwrap();
        assert!(echo.matches(&first));
        let echo = ControlCodec.decode(&mut buf).unwrap().unwrap();
        assert!(echo.matches(&second));
        assert!(ControlCodec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_echo_mismatch() {
        let id = SessionId::new();
        let other = SessionId::new();
        let echo = Echo::new(other.to_wire());

        assert!(!echo.matches(&id));
        assert_eq!(echo.to_string_lossy(), other.to_string());

        // Uppercase is a different byte sequence
        let id: SessionId = "6f1c2a9e-4b7d-4e2a-9c3f-abcdef012345".parse().unwrap();
        let mut upper = id.to_wire();
        upper.make_ascii_uppercase();
        assert_ne!(upper, id.to_wire());
        assert!(!Echo::new(upper).matches(&id));
    }

    #[tokio::test]
    async fn test_control_stream_exchange() {
        let (relay_side, client_side) = tokio::io::duplex(1024);
        let (relay_read, relay_write) = tokio::io::split(relay_side);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);

        let mut sink = FramedWrite::new(relay_write, ControlCodec);
        let mut stream = FramedRead::new(relay_read, ControlCodec);

        let id = SessionId::new();
        sink.send(ControlCommand::NewSession(id)).await.unwrap();

        let mut notice = vec![0u8; 4 + SESSION_ID_LEN + 1];
        client_read.read_exact(&mut notice).await.unwrap();
        assert_eq!(&notice[..4], b"New\n");
        let echoed = &notice[4..4 + SESSION_ID_LEN];
        client_write.write_all(echoed).await.unwrap();
        client_write.write_all(b"\n").await.unwrap();

        let echo = stream.next().await.unwrap().unwrap();
        assert!(echo.matches(&id));
    }

    #[tokio::test]
    async fn test_truncated_echo_is_an_error() {
        let (relay_side, mut client_side) = tokio::io::duplex(1024);
        let mut stream = FramedRead::new(relay_side, ControlCodec);

        client_side.write_all(b"0123456789").await.unwrap();
        drop(client_side);

        assert!(stream.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_clean_close_ends_stream() {
        let (relay_side, mut client_side) = tokio::io::duplex(1024);
        let mut stream = FramedRead::new(relay_side, ControlCodec);

        client_side.write_all(b"\n").await.unwrap();
        drop(client_side);

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_preamble() {
        let (mut tunnel, mut relay) = tokio::io::duplex(1024);
        let id = SessionId::new();

        write_session_preamble(&mut tunnel, &id).await.unwrap();
        tunnel.write_all(b"payload").await.unwrap();

        assert_eq!(read_session_preamble(&mut relay).await.unwrap(), id);

        let mut payload = [0u8; 7];
        relay.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"payload");
    }

    #[tokio::test]
    async fn test_short_preamble() {
        let (mut tunnel, mut relay) = tokio::io::duplex(1024);
        tunnel.write_all(b"abc").await.unwrap();
        drop(tunnel);

        let err = read_session_preamble(&mut relay).await.unwrap_err();
        assert!(matches!(err, ProtoError::Io(_)));
    }
}
