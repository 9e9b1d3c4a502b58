use std::time::Duration;

use hexlink_frame::{ControllerState, FrameError};

use crate::coordinator::OperatingState;

/// Errors that can occur in link and coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] hexlink_transport::TransportError),

    /// Frame-level I/O error.
    #[error("frame error: {0}")]
    Frame(FrameError),

    /// The byte stream cannot be trusted any more; the connection is closed.
    #[error("framing error: {0}")]
    Framing(FrameError),

    /// The connection dropped while the operation was pending.
    #[error("connection to the controller was lost")]
    ConnectionLost,

    /// No controller is connected.
    #[error("not connected to the controller")]
    NotConnected,

    /// No status arrived for a command in time.
    #[error("command {sequence} timed out after {timeout:?} waiting for status")]
    CommandTimeout { sequence: u32, timeout: Duration },

    /// The controller answered with a non-success status.
    #[error("command {sequence} rejected by controller (status {status})")]
    CommandRejected { sequence: u32, status: u32 },

    /// The controller did not connect in time.
    #[error("timed out after {0:?} waiting for the controller to connect")]
    ConnectTimeout(Duration),

    /// The controller connected but sent no config or telemetry in time.
    #[error("timed out after {0:?} waiting for config and telemetry")]
    ConfigTimeout(Duration),

    /// The operation is not legal in the current operating state.
    #[error("cannot {operation} in state {state}")]
    IllegalTransition {
        operation: &'static str,
        state: OperatingState,
    },

    /// The controller did not reach the expected state.
    #[error("controller state is {actual:?}; expected {expected:?}")]
    ControllerState {
        expected: ControllerState,
        actual: Option<ControllerState>,
    },

    /// The controller is being commanded by another source.
    #[error("controller is not commandable")]
    NotCommandable,

    /// Every command sequence number has been used on this link.
    #[error("command sequence numbers exhausted")]
    SequenceExhausted,

    /// The link or coordinator has been closed.
    #[error("closed")]
    Closed,
}

impl From<FrameError> for PeerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => PeerError::ConnectionLost,
            err if err.is_framing() => PeerError::Framing(err),
            err => PeerError::Frame(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_are_classified() {
        assert!(matches!(
            PeerError::from(FrameError::UnknownFrameId(3)),
            PeerError::Framing(_)
        ));
        assert!(matches!(
            PeerError::from(FrameError::ConnectionClosed),
            PeerError::ConnectionLost
        ));
        assert!(matches!(
            PeerError::from(FrameError::Io(std::io::Error::other("boom"))),
            PeerError::Frame(_)
        ));
    }

    #[test]
    fn illegal_transition_names_state() {
        let err = PeerError::IllegalTransition {
            operation: "enable",
            state: OperatingState::Fault,
        };
        assert_eq!(err.to_string(), "cannot enable in state fault");
    }
}
