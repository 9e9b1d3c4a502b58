//! Supervisor side of a packed binary command/telemetry link to a
//! low-level motion controller.
//!
//! The controller dials in over TCP; hexlink accepts exactly one connection
//! at a time, sends fixed-layout commands, matches their statuses and keeps
//! a local operating state in step with the controller's telemetry.
//!
//! # Crate Structure
//!
//! - [`transport`]: single-client TCP acceptor and dialer
//! - [`frame`]: packed little-endian records and the async frame reader/writer
//! - [`peer`]: the link, acknowledgement tracking, state coordination and a mock controller

/// Re-export transport types.
pub mod transport {
    pub use hexlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use hexlink_frame::*;
}

/// Re-export link, coordinator and mock types.
pub mod peer {
    pub use hexlink_peer::*;
}
