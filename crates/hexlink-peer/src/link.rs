use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use hexlink_frame::{
    Command, CommandStatus, Config, FrameConfig, FrameError, FrameReader, FrameWriter, Header,
    Inbound, InboundFrame, Telemetry, DEFAULT_COMMANDER_ID, NUM_PARAMS,
};
use hexlink_transport::{
    AcceptorConfig, ConnectionMonitor, ConnectionState, SingleClientAcceptor,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack::{AckHandle, AckTracker};
use crate::error::{PeerError, Result};

const EVENT_CAPACITY: usize = 256;

/// Settings for a [`TelemetryCommandLink`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub acceptor: AcceptorConfig,
    /// Written into every command's sync pattern.
    pub commander_id: u16,
    /// How long [`TelemetryCommandLink::run_command`] waits for a status.
    pub ack_timeout: Duration,
    pub frame: FrameConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            acceptor: AcceptorConfig::default(),
            commander_id: DEFAULT_COMMANDER_ID,
            ack_timeout: Duration::from_secs(5),
            frame: FrameConfig::default(),
        }
    }
}

/// A received record with the header it arrived under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<T> {
    pub header: Header,
    pub body: T,
    /// Connection generation the record arrived on.
    pub generation: u64,
    /// Count of records of this kind received by the link, starting at 1.
    pub index: u64,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the socket on a frame boundary.
    PeerClosed,
    /// The byte stream could not be parsed.
    Framing(String),
    /// The socket failed.
    Io(String),
    /// Closed from this side.
    Closed,
}

impl DisconnectReason {
    /// True unless this side asked for the disconnect.
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, DisconnectReason::Closed)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed => f.write_str("peer closed the connection"),
            DisconnectReason::Framing(msg) => write!(f, "framing error: {msg}"),
            DisconnectReason::Io(msg) => write!(f, "I/O error: {msg}"),
            DisconnectReason::Closed => f.write_str("closed locally"),
        }
    }
}

/// Notifications published by the link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected {
        peer_addr: SocketAddr,
        generation: u64,
    },
    Disconnected {
        generation: u64,
        reason: DisconnectReason,
    },
    Telemetry(Sample<Telemetry>),
    Config(Sample<Config>),
}

struct WriterState {
    writer: Option<FrameWriter<OwnedWriteHalf>>,
    generation: u64,
    next_sequence: u32,
    conn_cancel: Option<CancellationToken>,
}

struct Inner {
    config: LinkConfig,
    acceptor: SingleClientAcceptor,
    tracker: AckTracker,
    writer: Mutex<WriterState>,
    connection: watch::Sender<ConnectionState>,
    telemetry: watch::Sender<Option<Sample<Telemetry>>>,
    config_rx: watch::Sender<Option<Sample<Config>>>,
    telemetry_count: AtomicU64,
    config_count: AtomicU64,
    events: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
    closed: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// One multiplexed command/telemetry socket to the controller.
///
/// Inbound frames are routed by frame id: statuses to the
/// [`AckTracker`], telemetry and config to watch channels and the event
/// stream. A framing error closes the connection; the link then waits for
/// the controller to reconnect.
///
/// Cloning is cheap; clones share the same socket.
#[derive(Clone)]
pub struct TelemetryCommandLink {
    inner: Arc<Inner>,
}

impl TelemetryCommandLink {
    /// Bind the listening socket and start waiting for the controller.
    pub async fn bind(config: LinkConfig) -> Result<Self> {
        let acceptor = SingleClientAcceptor::bind(config.acceptor.clone()).await?;
        let (connection, _) = watch::channel(ConnectionState::Connecting);
        let (telemetry, _) = watch::channel(None);
        let (config_rx, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            config,
            acceptor,
            tracker: AckTracker::new(),
            writer: Mutex::new(WriterState {
                writer: None,
                generation: 0,
                next_sequence: 1,
                conn_cancel: None,
            }),
            connection,
            telemetry,
            config_rx,
            telemetry_count: AtomicU64::new(0),
            config_count: AtomicU64::new(0),
            events,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            task: StdMutex::new(None),
        });

        let task = tokio::spawn(supervise(Arc::clone(&inner)));
        *inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(Self { inner })
    }

    /// Address the controller should dial.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.acceptor.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.inner.acceptor.port()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &AckTracker {
        &self.inner.tracker
    }

    /// Subscribe to link events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn telemetry_receiver(&self) -> watch::Receiver<Option<Sample<Telemetry>>> {
        self.inner.telemetry.subscribe()
    }

    pub fn config_receiver(&self) -> watch::Receiver<Option<Sample<Config>>> {
        self.inner.config_rx.subscribe()
    }

    pub fn latest_telemetry(&self) -> Option<Sample<Telemetry>> {
        *self.inner.telemetry.borrow()
    }

    pub fn latest_config(&self) -> Option<Sample<Config>> {
        *self.inner.config_rx.borrow()
    }

    /// Generation of the current connection, if any.
    pub async fn generation(&self) -> Option<u64> {
        let state = self.inner.writer.lock().await;
        state.writer.as_ref().map(|_| state.generation)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Serialize and send one command.
    ///
    /// Fails fast with [`PeerError::NotConnected`] when no controller is
    /// connected; nothing is written in that case. The returned handle
    /// resolves when the matching status arrives.
    ///
    /// The write runs in its own task holding the write lock, so dropping
    /// this future never leaves a partial command on the wire.
    pub async fn send_command(
        &self,
        code: impl Into<u32>,
        params: [f64; NUM_PARAMS],
    ) -> Result<AckHandle> {
        let inner = Arc::clone(&self.inner);
        let code = code.into();
        tokio::spawn(async move { inner.write_command(code, params).await })
            .await
            .map_err(|_| PeerError::Closed)?
    }

    /// Send a command and wait for a successful status.
    pub async fn run_command(
        &self,
        code: impl Into<u32>,
        params: [f64; NUM_PARAMS],
    ) -> Result<CommandStatus> {
        let handle = self.send_command(code, params).await?;
        let sequence = handle.sequence();
        let status = self
            .inner
            .tracker
            .wait(handle, self.inner.config.ack_timeout)
            .await?;
        if !status.is_success() {
            return Err(PeerError::CommandRejected {
                sequence,
                status: status.status,
            });
        }
        Ok(status)
    }

    /// Wait for telemetry newer than what has been seen so far.
    ///
    /// Skips `skip` samples and returns the one after.
    pub async fn next_telemetry(&self, skip: usize) -> Result<Sample<Telemetry>> {
        let mut rx = self.inner.telemetry.subscribe();
        let seen = rx.borrow_and_update().map_or(0, |sample| sample.index);
        let skip = u64::try_from(skip).unwrap_or(u64::MAX);
        let target = seen.saturating_add(skip).saturating_add(1);
        let sample = rx
            .wait_for(|sample| sample.is_some_and(|s| s.index >= target))
            .await
            .map_err(|_| PeerError::Closed)?;
        (*sample).ok_or(PeerError::Closed)
    }

    /// Close the current connection, if any, and keep listening.
    pub async fn drop_connection(&self) {
        let state = self.inner.writer.lock().await;
        if let Some(cancel) = &state.conn_cancel {
            cancel.cancel();
        }
    }

    /// Close the connection and stop listening.
    ///
    /// Pending commands fail with [`PeerError::ConnectionLost`]. Calling this
    /// again is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.acceptor.close().await;
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner
            .connection
            .send_replace(ConnectionState::Disconnected);
        info!(port = self.port(), "link closed");
    }
}

impl ConnectionMonitor for TelemetryCommandLink {
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }
}

impl std::fmt::Debug for TelemetryCommandLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCommandLink")
            .field("local_addr", &self.local_addr())
            .field("state", &self.connection_state())
            .finish()
    }
}

impl Inner {
    async fn write_command(&self, code: u32, params: [f64; NUM_PARAMS]) -> Result<AckHandle> {
        let mut guard = self.writer.lock().await;
        let state = &mut *guard;
        let Some(writer) = state.writer.as_mut() else {
            return Err(PeerError::NotConnected);
        };

        let sequence = state.next_sequence;
        let next = sequence
            .checked_add(1)
            .ok_or(PeerError::SequenceExhausted)?;
        let command = Command {
            sync_pattern: self.config.commander_id,
            counter: sequence,
            code,
            params,
        };

        // Registered before the write so the status cannot beat the entry.
        let handle = self.tracker.register(sequence);
        state.next_sequence = next;

        match writer.write_frame(&command).await {
            Ok(()) => {
                debug!(sequence, code, generation = state.generation, "command sent");
                Ok(handle)
            }
            Err(err) => {
                self.tracker.cancel(sequence);
                warn!(sequence, code, error = %err, "command write failed");
                if let Some(cancel) = &state.conn_cancel {
                    cancel.cancel();
                }
                Err(match err {
                    FrameError::ConnectionClosed => PeerError::ConnectionLost,
                    other => other.into(),
                })
            }
        }
    }

    fn dispatch(&self, frame: InboundFrame, generation: u64) {
        let header = frame.header;
        match frame.body {
            Inbound::CommandStatus(status) => {
                self.tracker.resolve(status);
            }
            Inbound::Telemetry(body) => {
                let index = self.telemetry_count.fetch_add(1, Ordering::AcqRel) + 1;
                let sample = Sample {
                    header,
                    body,
                    generation,
                    index,
                };
                self.telemetry.send_replace(Some(sample));
                let _ = self.events.send(LinkEvent::Telemetry(sample));
            }
            Inbound::Config(body) => {
                let index = self.config_count.fetch_add(1, Ordering::AcqRel) + 1;
                let sample = Sample {
                    header,
                    body,
                    generation,
                    index,
                };
                debug!(
                    generation,
                    min_position = body.min_position,
                    max_position = body.max_position,
                    max_velocity = body.max_velocity,
                    "config received"
                );
                self.config_rx.send_replace(Some(sample));
                let _ = self.events.send(LinkEvent::Config(sample));
            }
        }
    }
}

async fn supervise(inner: Arc<Inner>) {
    loop {
        let conn = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            conn = inner.acceptor.accept() => match conn {
                Some(conn) => conn,
                None => break,
            },
        };

        let generation = conn.generation();
        let peer_addr = conn.peer_addr();
        let (stream, slot) = conn.into_parts();
        let (read_half, write_half) = stream.into_split();
        let conn_cancel = inner.cancel.child_token();

        {
            let mut state = inner.writer.lock().await;
            state.writer = Some(FrameWriter::new(write_half));
            state.generation = generation;
            state.conn_cancel = Some(conn_cancel.clone());
        }
        inner.connection.send_replace(ConnectionState::Connected);
        info!(%peer_addr, generation, "controller connected");
        let _ = inner.events.send(LinkEvent::Connected {
            peer_addr,
            generation,
        });

        let reader = FrameReader::with_config(read_half, inner.config.frame.clone());
        let reason = read_loop(&inner, reader, generation, &conn_cancel).await;

        {
            let mut state = inner.writer.lock().await;
            state.conn_cancel = None;
            if let Some(mut writer) = state.writer.take() {
                let _ = writer.shutdown().await;
            }
        }
        let failed = inner.tracker.fail_all();
        drop(slot);

        if reason.is_unexpected() {
            warn!(generation, %reason, failed, "controller disconnected");
        } else {
            info!(generation, failed, "controller connection closed");
        }
        if !inner.closed.load(Ordering::Acquire) {
            inner.connection.send_replace(ConnectionState::Connecting);
        }
        let _ = inner
            .events
            .send(LinkEvent::Disconnected { generation, reason });
    }
    debug!("link supervisor stopped");
}

async fn read_loop(
    inner: &Inner,
    mut reader: FrameReader<OwnedReadHalf>,
    generation: u64,
    cancel: &CancellationToken,
) -> DisconnectReason {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return DisconnectReason::Closed,
            frame = reader.read_frame::<InboundFrame>() => frame,
        };
        match frame {
            Ok(frame) => inner.dispatch(frame, generation),
            Err(FrameError::ConnectionClosed) => return DisconnectReason::PeerClosed,
            Err(err) if err.is_framing() => {
                warn!(generation, error = %err, "framing error; closing connection");
                return DisconnectReason::Framing(err.to_string());
            }
            Err(err) => return DisconnectReason::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use hexlink_frame::{
        encode_inbound, CommandCode, CommandStatusCode, Timestamp, HEADER_SIZE,
    };
    use hexlink_transport::{dial, wait_for_state};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn bind_link() -> TelemetryCommandLink {
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(500),
            ..LinkConfig::default()
        };
        TelemetryCommandLink::bind(config)
            .await
            .expect("link should bind")
    }

    async fn connect(link: &TelemetryCommandLink) -> TcpStream {
        let mut state = link.subscribe_state();
        let stream = dial("127.0.0.1", link.port()).await.unwrap();
        tokio::time::timeout(WAIT, wait_for_state(&mut state, ConnectionState::Connected))
            .await
            .expect("link should report connected")
            .unwrap();
        stream
    }

    async fn read_command(stream: &mut TcpStream) -> Command {
        let mut buf = [0u8; 58];
        stream.read_exact(&mut buf).await.unwrap();
        hexlink_frame::decode_record(&buf).unwrap()
    }

    async fn write_inbound(stream: &mut TcpStream, body: Inbound) {
        let mut wire = BytesMut::new();
        encode_inbound(&InboundFrame::new(0x1234, 0, Timestamp::now(), body), &mut wire);
        stream.write_all(&wire).await.unwrap();
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_fast() {
        let link = bind_link().await;
        let err = link
            .send_command(CommandCode::Move, [0.0; NUM_PARAMS])
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::NotConnected));
        assert_eq!(link.tracker().pending(), 0);
        link.close().await;
    }

    #[tokio::test]
    async fn command_roundtrip_with_status() {
        let link = bind_link().await;
        let mut peer = connect(&link).await;

        let runner = {
            let link = link.clone();
            tokio::spawn(async move {
                link.run_command(CommandCode::Move, [1.5, 0.0, 0.0, 0.0, 0.0, 0.0])
                    .await
            })
        };

        let command = read_command(&mut peer).await;
        assert_eq!(command.sync_pattern, DEFAULT_COMMANDER_ID);
        assert_eq!(command.counter, 1);
        assert_eq!(command.command_code(), Some(CommandCode::Move));
        assert_eq!(command.param1(), 1.5);

        write_inbound(
            &mut peer,
            Inbound::CommandStatus(CommandStatus::new(1, CommandStatusCode::Ack, 0.25)),
        )
        .await;

        let status = runner.await.unwrap().unwrap();
        assert_eq!(status.duration, 0.25);
        link.close().await;
    }

    #[tokio::test]
    async fn rejected_status_is_an_error() {
        let link = bind_link().await;
        let mut peer = connect(&link).await;

        let runner = {
            let link = link.clone();
            tokio::spawn(async move { link.run_command(CommandCode::Move, [0.0; 6]).await })
        };
        let command = read_command(&mut peer).await;
        write_inbound(
            &mut peer,
            Inbound::CommandStatus(CommandStatus::new(
                command.counter,
                CommandStatusCode::NoAck,
                0.0,
            )),
        )
        .await;

        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, PeerError::CommandRejected { status: 2, .. }));
        link.close().await;
    }

    #[tokio::test]
    async fn telemetry_updates_watch_and_events() {
        let link = bind_link().await;
        let mut events = link.subscribe();
        let mut peer = connect(&link).await;

        let waiter = {
            let link = link.clone();
            tokio::spawn(async move { link.next_telemetry(1).await })
        };
        // Give the waiter time to record what it has already seen.
        tokio::time::sleep(Duration::from_millis(20)).await;

        for position in [1.0, 2.0] {
            write_inbound(
                &mut peer,
                Inbound::Telemetry(Telemetry {
                    curr_position: position,
                    ..Telemetry::default()
                }),
            )
            .await;
        }

        let sample = tokio::time::timeout(WAIT, waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sample.body.curr_position, 2.0);
        assert_eq!(sample.index, 2);
        assert_eq!(sample.generation, 1);

        let mut saw_connected = false;
        let mut telemetry_events = 0;
        while telemetry_events < 2 {
            match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
                LinkEvent::Connected { generation, .. } => {
                    assert_eq!(generation, 1);
                    saw_connected = true;
                }
                LinkEvent::Telemetry(_) => telemetry_events += 1,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_connected);
        link.close().await;
    }

    #[tokio::test]
    async fn framing_error_closes_connection() {
        let link = bind_link().await;
        let mut events = link.subscribe();
        let mut peer = connect(&link).await;

        let mut bogus = vec![0u8; HEADER_SIZE];
        bogus[2] = 0x42;
        peer.write_all(&bogus).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, peer.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let LinkEvent::Disconnected { reason, .. } = event {
                assert!(matches!(reason, DisconnectReason::Framing(_)));
                break;
            }
        }
        link.close().await;
    }

    #[tokio::test]
    async fn sequence_exhaustion_is_reported() {
        let link = bind_link().await;
        let _peer = connect(&link).await;
        link.inner.writer.lock().await.next_sequence = u32::MAX;

        let err = link
            .send_command(CommandCode::Move, [0.0; 6])
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::SequenceExhausted));
        assert_eq!(link.tracker().pending(), 0);
        link.close().await;
    }

    #[tokio::test]
    async fn abandoned_commands_stop_being_tracked() {
        let link = bind_link().await;
        let _peer = connect(&link).await;

        drop(link.send_command(CommandCode::Move, [0.0; 6]).await.unwrap());
        for _ in 0..10 {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(5),
                link.run_command(CommandCode::Move, [0.0; 6]),
            )
            .await;
            assert!(abandoned.is_err());
        }

        // Writes cut off mid-flight finish in their own task.
        tokio::time::timeout(WAIT, async {
            while link.tracker().pending() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("abandoned commands should be forgotten");
        link.close().await;
    }

    #[tokio::test]
    async fn next_telemetry_with_huge_skip_waits_instead_of_panicking() {
        let link = bind_link().await;
        let waited =
            tokio::time::timeout(Duration::from_millis(20), link.next_telemetry(usize::MAX)).await;
        assert!(waited.is_err());
        link.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_pending() {
        let link = bind_link().await;
        let _peer = connect(&link).await;
        let handle = link.send_command(CommandCode::Move, [0.0; 6]).await.unwrap();

        link.close().await;
        link.close().await;

        assert!(link.is_closed());
        assert_eq!(link.connection_state(), ConnectionState::Disconnected);
        let err = link.tracker().wait(handle, WAIT).await.unwrap_err();
        assert!(matches!(err, PeerError::ConnectionLost));
    }
}
