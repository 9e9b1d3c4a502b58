//! Simulated low-level controller.
//!
//! [`MockPeer`] dials the supervisor like the real controller does, sends
//! its config, streams telemetry on a fixed cadence and answers commands
//! according to a small state machine. Test hooks let callers inject a
//! fault, silence telemetry, take away command authority or drop the
//! socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use hexlink_frame::{
    application_status, Command, CommandCode, CommandStatus, CommandStatusCode, Config,
    ControllerState, EnabledSubstate, FrameError, FrameReader, FrameWriter, Inbound,
    InboundFrame, SetStateParam, Telemetry, Timestamp, DEFAULT_COMMANDER_ID,
};
use hexlink_transport::{dial, ConnectionMonitor, ConnectionState};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Settings for a [`MockPeer`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Supervisor host to dial.
    pub host: String,
    /// Supervisor port to dial.
    pub port: u16,
    /// Commands with any other sync pattern are refused.
    pub commander_id: u16,
    pub telemetry_interval: Duration,
    /// Pause between connection attempts.
    pub retry_interval: Duration,
    /// Dial again after the connection ends.
    pub reconnect: bool,
    pub initial_state: ControllerState,
    pub initial_config: Config,
}

impl MockConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            commander_id: DEFAULT_COMMANDER_ID,
            telemetry_interval: Duration::from_millis(100),
            retry_interval: Duration::from_millis(100),
            reconnect: true,
            initial_state: ControllerState::Standby,
            initial_config: Config {
                min_position: -25.0,
                max_position: 25.0,
                max_velocity: 20.0,
            },
        }
    }
}

/// What a command did to the model.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Outcome {
    status: CommandStatusCode,
    duration: f64,
    config_changed: bool,
}

impl Outcome {
    fn ack(duration: f64) -> Self {
        Self {
            status: CommandStatusCode::Ack,
            duration,
            config_changed: false,
        }
    }

    fn refuse() -> Self {
        Self {
            status: CommandStatusCode::NoAck,
            duration: 0.0,
            config_changed: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Model {
    commander_id: u16,
    state: ControllerState,
    application_status: u32,
    error_code: u32,
    position: f64,
    cmd_position: f64,
    config: Config,
}

impl Model {
    fn new(config: &MockConfig) -> Self {
        Self {
            commander_id: config.commander_id,
            state: config.initial_state,
            application_status: application_status::COMMANDABLE,
            error_code: 0,
            position: 0.0,
            cmd_position: 0.0,
            config: config.initial_config,
        }
    }

    fn telemetry(&self, time: f64) -> Telemetry {
        Telemetry {
            time,
            application_status: self.application_status,
            state: self.state.raw(),
            enabled_substate: EnabledSubstate::Stationary.raw(),
            offline_substate: 0,
            error_code: self.error_code,
            curr_position: self.position,
            cmd_position: self.cmd_position,
        }
    }

    fn drives_enabled(&self) -> bool {
        self.application_status & application_status::DRIVES_ENABLED != 0
    }

    fn apply(&mut self, command: &Command) -> Outcome {
        if command.sync_pattern != self.commander_id {
            warn!(
                sync_pattern = command.sync_pattern,
                "refusing command from unknown commander"
            );
            return Outcome::refuse();
        }
        if self.application_status & application_status::COMMANDABLE == 0 {
            debug!(code = command.code, "refusing command; not commandable");
            return Outcome::refuse();
        }

        match command.command_code() {
            Some(CommandCode::SetState) => match SetStateParam::from_param(command.param1()) {
                Some(param) if self.set_state(param) => Outcome::ack(0.0),
                _ => Outcome::refuse(),
            },
            Some(CommandCode::EnableDrives) => {
                if command.param1() != 0.0 {
                    self.application_status |= application_status::DRIVES_ENABLED;
                } else {
                    self.application_status &= !application_status::DRIVES_ENABLED;
                }
                Outcome::ack(0.0)
            }
            Some(CommandCode::Move) => {
                let target = command.param1();
                let limits = self.config;
                if self.state != ControllerState::Enabled
                    || !(limits.min_position..=limits.max_position).contains(&target)
                {
                    return Outcome::refuse();
                }
                let duration = (target - self.position).abs() / limits.max_velocity;
                self.position = target;
                self.cmd_position = target;
                Outcome::ack(duration)
            }
            Some(CommandCode::ConfigVelocity) => {
                let velocity = command.param1();
                if self.state != ControllerState::Enabled || !(velocity > 0.0 && velocity.is_finite())
                {
                    return Outcome::refuse();
                }
                self.config.max_velocity = velocity;
                Outcome {
                    config_changed: true,
                    ..Outcome::ack(0.0)
                }
            }
            None => {
                warn!(code = command.code, "refusing unknown command");
                Outcome::refuse()
            }
        }
    }

    fn set_state(&mut self, param: SetStateParam) -> bool {
        use ControllerState::*;

        let next = match (param, self.state) {
            (SetStateParam::ClearError, Fault | Standby | Offline) => Standby,
            (SetStateParam::EnterControl, Offline) => Standby,
            (SetStateParam::Start, Standby) => Disabled,
            (SetStateParam::Enable, Standby | Disabled) if self.drives_enabled() => Enabled,
            (SetStateParam::Disable, Enabled) => Disabled,
            (SetStateParam::Standby, Enabled | Disabled | Standby) => Standby,
            (SetStateParam::Exit, Standby) => Offline,
            (param, state) => {
                debug!(?param, ?state, "refusing state change");
                return false;
            }
        };
        if next == Standby {
            self.error_code = 0;
        }
        debug!(from = ?self.state, to = ?next, "mock controller state changed");
        self.state = next;
        true
    }
}

struct Outbound {
    writer: FrameWriter<OwnedWriteHalf>,
    sync_pattern: u16,
    counter: u16,
}

impl Outbound {
    async fn send(&mut self, body: Inbound) -> Result<()> {
        let frame = InboundFrame::new(self.sync_pattern, self.counter, Timestamp::now(), body);
        self.counter = self.counter.wrapping_add(1);
        self.writer.write_frame(&frame).await?;
        Ok(())
    }

    async fn send_telemetry(&mut self, model: &Model) -> Result<()> {
        let timestamp = Timestamp::now();
        let body = Inbound::Telemetry(model.telemetry(timestamp.as_secs_f64()));
        let frame = InboundFrame::new(self.sync_pattern, self.counter, timestamp, body);
        self.counter = self.counter.wrapping_add(1);
        self.writer.write_frame(&frame).await?;
        Ok(())
    }
}

struct Shared {
    config: MockConfig,
    model: StdMutex<Model>,
    received: StdMutex<Vec<Command>>,
    muted: AtomicBool,
    unresponsive: AtomicBool,
    connection: watch::Sender<ConnectionState>,
    conn_cancel: StdMutex<Option<CancellationToken>>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn model(&self) -> MutexGuard<'_, Model> {
        lock(&self.model)
    }
}

/// A simulated controller connected to a supervisor.
#[derive(Clone)]
pub struct MockPeer {
    shared: Arc<Shared>,
}

impl MockPeer {
    /// Start dialing the supervisor in the background.
    pub fn start(config: MockConfig) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            model: StdMutex::new(Model::new(&config)),
            config,
            received: StdMutex::new(Vec::new()),
            muted: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            connection,
            conn_cancel: StdMutex::new(None),
            cancel: CancellationToken::new(),
            task: StdMutex::new(None),
        });
        let task = tokio::spawn(run(Arc::clone(&shared)));
        *lock(&shared.task) = Some(task);
        Self { shared }
    }

    pub fn config(&self) -> &MockConfig {
        &self.shared.config
    }

    /// Current controller state.
    pub fn state(&self) -> ControllerState {
        self.shared.model().state
    }

    /// Telemetry as it would be sent now, with a zero timestamp.
    pub fn telemetry(&self) -> Telemetry {
        self.shared.model().telemetry(0.0)
    }

    /// Current motion limits.
    pub fn motion_config(&self) -> Config {
        self.shared.model().config
    }

    /// Every command received so far, in order.
    pub fn received_commands(&self) -> Vec<Command> {
        lock(&self.shared.received).clone()
    }

    /// Go to fault and report `error_code` from the next telemetry on.
    pub fn inject_fault(&self, error_code: u32) {
        let mut model = self.shared.model();
        model.state = ControllerState::Fault;
        model.error_code = error_code;
        info!(error_code, "mock controller fault injected");
    }

    /// Stop or resume telemetry. Command statuses are still sent.
    pub fn set_mute(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
    }

    /// Record commands without acting on or answering them.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.shared.unresponsive.store(unresponsive, Ordering::Release);
    }

    /// Give or take away command authority.
    pub fn set_commandable(&self, commandable: bool) {
        let mut model = self.shared.model();
        if commandable {
            model.application_status |= application_status::COMMANDABLE;
        } else {
            model.application_status &= !application_status::COMMANDABLE;
        }
    }

    /// Close the current socket. Dials again if `reconnect` is set.
    pub fn drop_connection(&self) {
        if let Some(cancel) = lock(&self.shared.conn_cancel).as_ref() {
            cancel.cancel();
        }
    }

    /// Close the socket and stop dialing.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let task = lock(&self.shared.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared
            .connection
            .send_replace(ConnectionState::Disconnected);
    }
}

impl ConnectionMonitor for MockPeer {
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("state", &self.state())
            .finish()
    }
}

async fn run(shared: Arc<Shared>) {
    let config = &shared.config;
    loop {
        shared.connection.send_replace(ConnectionState::Connecting);
        let dialed = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            dialed = dial(&config.host, config.port) => dialed,
        };

        match dialed {
            Ok(stream) => {
                let conn_cancel = shared.cancel.child_token();
                *lock(&shared.conn_cancel) = Some(conn_cancel.clone());
                shared.connection.send_replace(ConnectionState::Connected);
                info!(host = %config.host, port = config.port, "mock controller connected");

                match serve(&shared, stream, &conn_cancel).await {
                    Ok(()) => info!("mock controller connection closed"),
                    Err(err) => warn!(error = %err, "mock controller connection failed"),
                }
                *lock(&shared.conn_cancel) = None;
                if !config.reconnect {
                    break;
                }
            }
            Err(err) => debug!(error = %err, "supervisor not reachable; retrying"),
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(config.retry_interval) => {}
        }
    }
    shared
        .connection
        .send_replace(ConnectionState::Disconnected);
}

async fn serve(shared: &Shared, stream: TcpStream, cancel: &CancellationToken) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut out = Outbound {
        writer: FrameWriter::new(write_half),
        sync_pattern: shared.config.commander_id,
        counter: 0,
    };

    let config = shared.model().config;
    out.send(Inbound::Config(config)).await?;

    let mut ticker = tokio::time::interval(shared.config.telemetry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !shared.muted.load(Ordering::Acquire) {
                    let model = shared.model().clone();
                    out.send_telemetry(&model).await?;
                }
            }
            command = reader.read_frame::<Command>() => {
                let command = match command {
                    Ok(command) => command,
                    Err(FrameError::ConnectionClosed) => break,
                    Err(err) => return Err(err.into()),
                };
                lock(&shared.received).push(command);
                if shared.unresponsive.load(Ordering::Acquire) {
                    debug!(sequence = command.counter, "mock controller ignored command");
                    continue;
                }

                let (outcome, model) = {
                    let mut model = shared.model();
                    let outcome = model.apply(&command);
                    (outcome, model.clone())
                };
                debug!(
                    sequence = command.counter,
                    code = command.code,
                    status = ?outcome.status,
                    "mock controller answered command"
                );
                out.send(Inbound::CommandStatus(CommandStatus::new(
                    command.counter,
                    outcome.status,
                    outcome.duration,
                )))
                .await?;
                if outcome.config_changed {
                    out.send(Inbound::Config(model.config)).await?;
                }
                if !shared.muted.load(Ordering::Acquire) {
                    out.send_telemetry(&model).await?;
                }
            }
        }
    }

    let _ = out.writer.shutdown().await;
    Ok(())
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
