//! Session coordination for the rocky relay
//!
//! - [`SessionRegistry`] parks tunnel connections until their handshake claims them
//! - [`TunnelIntake`] reads tunnel preambles and feeds the registry
//! - [`ControlSession`] drives one client control connection, running a
//!   handshake coordinator per public connection it accepts

mod channel;
pub mod error;
pub mod handshake;
pub mod intake;
pub mod registry;
pub mod session;

pub use error::{HandshakeError, IntakeError};
pub use handshake::{HandshakeConfig, HandshakeState, DEFAULT_TUNNEL_WAIT};
pub use intake::{TunnelIntake, DEFAULT_PREAMBLE_TIMEOUT};
pub use registry::{spawn_reaper, SessionRegistry};
pub use session::{ControlSession, PublicEndpoint};
