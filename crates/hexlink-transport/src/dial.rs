use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TransportError};

/// Connect to a listening acceptor.
///
/// Only the controller side dials; the supervisor never does.
pub async fn dial(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%addr, error = %err, "could not set TCP_NODELAY");
    }
    debug!(%addr, "connected");
    Ok(stream)
}
