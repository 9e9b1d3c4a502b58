use tokio::sync::watch;

use crate::error::{Result, TransportError};

/// Lifecycle of the single peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not listening (never bound, or closed).
    Disconnected,
    /// Listening and waiting for a peer.
    Connecting,
    /// A peer is current.
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that owns one end of a link and can report its connection state.
///
/// Implemented by the listening side and by the mock controller so tests and
/// the coordinator can react to connects and disconnects without polling.
pub trait ConnectionMonitor {
    /// A receiver that observes every state change from now on.
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    fn connection_state(&self) -> ConnectionState {
        *self.subscribe_state().borrow()
    }

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

/// Wait until `rx` reports `target`.
///
/// Fails with [`TransportError::Shutdown`] if the owner goes away first.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    target: ConnectionState,
) -> Result<()> {
    rx.wait_for(|state| *state == target)
        .await
        .map(|_| ())
        .map_err(|_| TransportError::Shutdown)
}
