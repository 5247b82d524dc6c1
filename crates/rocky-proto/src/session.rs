//! Session identifiers
//!
//! Every public connection is tagged with a fresh random v4 UUID. The id travels
//! in its canonical lowercase hyphenated form, which is always exactly
//! [`SESSION_ID_LEN`] bytes long, both on the control stream and as the
//! preamble of a tunnel connection.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::ProtoError;

/// Length in bytes of a session id on the wire
pub const SESSION_ID_LEN: usize = uuid::fmt::Hyphenated::LENGTH;

/// Identifier tying a public connection to the tunnel connection that serves it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Canonical wire form of the id
    pub fn to_wire(&self) -> [u8; SESSION_ID_LEN] {
        let mut buf = [0u8; SESSION_ID_LEN];
        self.0.hyphenated().encode_lower(&mut buf);
        buf
    }

    /// Parse an id from exactly [`SESSION_ID_LEN`] bytes
    pub fn from_wire(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() != SESSION_ID_LEN {
            return Err(ProtoError::InvalidSessionId(format!(
                "expected {} bytes, got {}",
                SESSION_ID_LEN,
                bytes.len()
            )));
        }

        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProtoError::InvalidSessionId("not valid UTF-8".to_string()))?;
        text.parse()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for SessionId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Only the hyphenated form is accepted; braced or simple forms have other lengths
        if s.len() != SESSION_ID_LEN {
            return Err(ProtoError::InvalidSessionId(s.to_string()));
        }

        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtoError::InvalidSessionId(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_wire_form_is_canonical() {
        let id = SessionId::new();
        let wire = id.to_wire();

        assert_eq!(wire.len(), 36);
        assert_eq!(&wire[..], id.to_string().as_bytes());
        assert_eq!(wire[8], b'-');
        assert_eq!(wire[13], b'-');
        assert!(wire.iter().all(|b| !b.is_ascii_uppercase()));
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn test_from_wire() {
        let id = SessionId::new();
        assert_eq!(SessionId::from_wire(&id.to_wire()).unwrap(), id);

        assert!(SessionId::from_wire(b"short").is_err());
        assert!(SessionId::from_wire(&[b'z'; SESSION_ID_LEN]).is_err());
        assert!(SessionId::from_wire(&[0xff; SESSION_ID_LEN]).is_err());
    }

    #[test]
    fn test_parse_rejects_other_uuid_forms() {
        let id = SessionId::new();
        let simple = id.as_uuid().simple().to_string();
        let braced = id.as_uuid().braced().to_string();

        assert!(simple.parse::<SessionId>().is_err());
        assert!(braced.parse::<SessionId>().is_err());
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_generation_is_unique() {
        let handles: Vec<_> = (0..10_000)
            .map(|_| tokio::spawn(async { SessionId::new() }))
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }

        assert_eq!(ids.len(), 10_000);
    }
}
