//! Command/telemetry protocol engine.
//!
//! - [`TelemetryCommandLink`] owns the listening socket, runs the read loop
//!   and serialises command writes.
//! - [`AckTracker`] matches command statuses to the commands that caused them.
//! - [`ControllerStateCoordinator`] reconciles the local operating state with
//!   the state the controller reports.
//! - [`MockPeer`] plays the controller side for tests and simulation.

pub mod ack;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod mock;

pub use ack::{AckHandle, AckTracker};
pub use coordinator::{
    ControllerStateCoordinator, CoordinatorConfig, CoordinatorEvent, ErrorCode, FaultReport,
    OperatingState,
};
pub use error::{PeerError, Result};
pub use link::{DisconnectReason, LinkConfig, LinkEvent, Sample, TelemetryCommandLink};
pub use mock::{MockConfig, MockPeer};
