//! TCP transport for the controller link.
//!
//! The low-level controller always dials; this side only listens. A
//! [`SingleClientAcceptor`] keeps at most one peer connection current and
//! refuses any other connection attempt until that peer goes away.
//!
//! This is the lowest layer of hexlink. Everything else builds on top of
//! the [`Connection`] handed out here.

pub mod acceptor;
pub mod dial;
pub mod error;
pub mod traits;

pub use acceptor::{AcceptorConfig, Connection, ConnectionSlot, SingleClientAcceptor};
pub use dial::dial;
pub use error::{Result, TransportError};
pub use traits::{wait_for_state, ConnectionMonitor, ConnectionState};
