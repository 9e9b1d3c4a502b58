use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{ConnectionMonitor, ConnectionState};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where and how to listen.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Label used in log output.
    pub name: String,
    pub host: String,
    /// 0 picks a free port; read it back with [`SingleClientAcceptor::port`].
    pub port: u16,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

impl AcceptorConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

struct Shared {
    name: String,
    occupied: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

/// Keeps the peer slot occupied while alive.
///
/// Dropping it frees the slot so the next connection attempt is accepted.
pub struct ConnectionSlot {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.shared.occupied.store(false, Ordering::Release);
        if !self.shared.closed.load(Ordering::Acquire) {
            self.shared.state.send_replace(ConnectionState::Connecting);
        }
        debug!(
            name = %self.shared.name,
            generation = self.generation,
            "peer slot released"
        );
    }
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("generation", &self.generation)
            .finish()
    }
}

/// The current peer connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    slot: ConnectionSlot,
}

impl Connection {
    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 1 for the first accepted peer, incremented for each one after.
    pub fn generation(&self) -> u64 {
        self.slot.generation
    }

    /// Split into the stream and the slot guard.
    ///
    /// Keep the slot alive for as long as the stream (or either of its
    /// halves) is in use.
    pub fn into_parts(self) -> (TcpStream, ConnectionSlot) {
        (self.stream, self.slot)
    }
}

/// A TCP listener that keeps at most one peer connection current.
///
/// While a peer is current every other connection attempt is accepted at the
/// TCP level and closed immediately. Once the [`Connection`] (or its
/// [`ConnectionSlot`]) is dropped the next attempt is accepted.
///
/// State changes are published on a watch channel: `Connecting` after bind,
/// `Connected` while a peer is current, `Disconnected` after [`close`].
///
/// [`close`]: SingleClientAcceptor::close
pub struct SingleClientAcceptor {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<Connection>>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SingleClientAcceptor {
    /// Bind and begin accepting in a background task.
    pub async fn bind(config: AcceptorConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            name: config.name,
            occupied: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            state,
        });

        info!(name = %shared.name, %local_addr, "listening");

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            shared,
            local_addr,
            incoming: Mutex::new(rx),
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    /// Wait for the next peer.
    ///
    /// Returns `None` once the acceptor is closed.
    pub async fn accept(&self) -> Option<Connection> {
        if self.is_closed() {
            return None;
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            conn = incoming.recv() => conn,
        }
    }

    /// The bound address, with port 0 resolved to the real port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop listening and release the port.
    ///
    /// Calling this again is a no-op. A connection already handed out stays
    /// open until its owner drops it.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.state.send_replace(ConnectionState::Disconnected);
        info!(name = %self.shared.name, local_addr = %self.local_addr, "closed");
    }
}

impl ConnectionMonitor for SingleClientAcceptor {
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl Drop for SingleClientAcceptor {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SingleClientAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleClientAcceptor")
            .field("name", &self.shared.name)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Connection>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(name = %shared.name, error = %TransportError::Accept(err), "accept failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                }
            }
        };

        if shared.occupied.swap(true, Ordering::AcqRel) {
            info!(
                name = %shared.name,
                %peer_addr,
                "Rejecting connection; a socket is already connected"
            );
            drop(stream);
            continue;
        }

        if let Err(err) = stream.set_nodelay(true) {
            debug!(name = %shared.name, error = %err, "could not set TCP_NODELAY");
        }

        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = ConnectionSlot {
            shared: Arc::clone(&shared),
            generation,
        };
        shared.state.send_replace(ConnectionState::Connected);
        info!(name = %shared.name, %peer_addr, generation, "peer connected");

        let conn = Connection {
            stream,
            peer_addr,
            slot,
        };
        if tx.send(conn).await.is_err() {
            break;
        }
    }
    debug!(name = %shared.name, "accept loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::dial::dial;
    use crate::traits::wait_for_state;

    const WAIT: Duration = Duration::from_secs(5);

    async fn bind_local() -> SingleClientAcceptor {
        SingleClientAcceptor::bind(AcceptorConfig::default().with_name("test"))
            .await
            .expect("acceptor should bind")
    }

    async fn accept_within(acceptor: &SingleClientAcceptor) -> Connection {
        tokio::time::timeout(WAIT, acceptor.accept())
            .await
            .expect("accept should not time out")
            .expect("acceptor should still be open")
    }

    #[tokio::test]
    async fn port_zero_resolves_to_bound_port() {
        let acceptor = bind_local().await;
        assert_ne!(acceptor.port(), 0);
        assert_eq!(acceptor.local_addr().port(), acceptor.port());
        assert_eq!(acceptor.connection_state(), ConnectionState::Connecting);
        acceptor.close().await;
    }

    #[tokio::test]
    async fn accepts_peer_and_exchanges_bytes() {
        let acceptor = bind_local().await;
        let mut client = dial("127.0.0.1", acceptor.port()).await.unwrap();

        let conn = accept_within(&acceptor).await;
        assert_eq!(conn.generation(), 1);
        assert!(acceptor.is_connected());

        let (mut stream, _slot) = conn.into_parts();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        acceptor.close().await;
    }

    #[tokio::test]
    async fn second_peer_is_rejected_while_first_is_current() {
        let acceptor = bind_local().await;
        let _first = dial("127.0.0.1", acceptor.port()).await.unwrap();
        let conn = accept_within(&acceptor).await;

        let mut second = dial("127.0.0.1", acceptor.port()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, second.read(&mut buf))
            .await
            .expect("rejected peer should see the socket close");
        assert!(matches!(read, Ok(0) | Err(_)));

        // The first peer is still the current one.
        assert_eq!(conn.generation(), 1);
        assert!(acceptor.is_connected());
        acceptor.close().await;
    }

    #[tokio::test]
    async fn slot_frees_after_connection_drops() {
        let acceptor = bind_local().await;
        let mut state = acceptor.subscribe_state();

        let first_client = dial("127.0.0.1", acceptor.port()).await.unwrap();
        let first = accept_within(&acceptor).await;
        wait_for_state(&mut state, ConnectionState::Connected)
            .await
            .unwrap();

        drop(first);
        drop(first_client);
        wait_for_state(&mut state, ConnectionState::Connecting)
            .await
            .unwrap();

        let _second_client = dial("127.0.0.1", acceptor.port()).await.unwrap();
        let second = accept_within(&acceptor).await;
        assert_eq!(second.generation(), 2);
        acceptor.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let acceptor = bind_local().await;
        let port = acceptor.port();

        acceptor.close().await;
        acceptor.close().await;

        assert!(acceptor.is_closed());
        assert_eq!(acceptor.connection_state(), ConnectionState::Disconnected);
        assert!(acceptor.accept().await.is_none());

        // The listener is gone, so the port refuses connections.
        assert!(dial("127.0.0.1", port).await.is_err());
    }

    #[tokio::test]
    async fn close_wakes_pending_accept() {
        let acceptor = Arc::new(bind_local().await);
        let waiter = {
            let acceptor = Arc::clone(&acceptor);
            tokio::spawn(async move { acceptor.accept().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        acceptor.close().await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn bind_reports_address_in_use() {
        let first = bind_local().await;
        let err = SingleClientAcceptor::bind(AcceptorConfig::new("127.0.0.1", first.port()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
        first.close().await;
    }
}
