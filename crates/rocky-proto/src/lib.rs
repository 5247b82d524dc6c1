//! Wire protocol for the rocky reverse-tunnel relay
//!
//! Defines the session identifier handed out to clients, the line-oriented
//! control stream codec, the fixed-width tunnel preamble, and the access policy
//! consulted before any connection reaches the relay core.

pub mod codec;
pub mod error;
pub mod ip_filter;
pub mod policy;
pub mod session;

pub use codec::{
    read_session_preamble, write_session_preamble, ControlCodec, ControlCommand, Echo,
    NEW_SESSION_NOTICE,
};
pub use error::ProtoError;
pub use ip_filter::{parse_network, IpFilter, IpFilterError};
pub use policy::{AccessPolicy, CountryResolver, CountryTable, CountryTableError, Decision};
pub use session::{SessionId, SESSION_ID_LEN};
