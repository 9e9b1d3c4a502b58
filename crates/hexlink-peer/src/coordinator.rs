use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use hexlink_frame::{
    Command, CommandCode, CommandStatus, Config, ControllerState, SetStateParam, Telemetry,
    NUM_PARAMS,
};
use hexlink_transport::{wait_for_state, ConnectionMonitor, ConnectionState};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PeerError, Result};
use crate::link::{DisconnectReason, LinkConfig, LinkEvent, Sample, TelemetryCommandLink};

const EVENT_CAPACITY: usize = 256;

/// Local operating state, reconciled against controller telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingState {
    /// Not listening.
    Disconnected,
    /// Listening; waiting for the controller, its config and telemetry.
    Connecting,
    /// Connected and configured but not enabled.
    Disabled,
    /// `enable()` is clearing a controller fault.
    ClearingFault,
    /// `enable()` is powering drives and enabling the controller.
    Enabling,
    Enabled,
    /// See [`ControllerStateCoordinator::fault_report`].
    Fault,
}

impl OperatingState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatingState::Disconnected => "disconnected",
            OperatingState::Connecting => "connecting",
            OperatingState::Disabled => "disabled",
            OperatingState::ClearingFault => "clearing_fault",
            OperatingState::Enabling => "enabling",
            OperatingState::Enabled => "enabled",
            OperatingState::Fault => "fault",
        }
    }

    /// States that require a live, configured connection.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            OperatingState::Disabled
                | OperatingState::ClearingFault
                | OperatingState::Enabling
                | OperatingState::Enabled
        )
    }
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the coordinator went to fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The controller reported fault while enabled.
    ControllerFault,
    /// The controller did not connect, or the connection dropped.
    ConnectionLost,
    /// The controller connected but never sent config.
    NoConfig,
    /// The controller sent bytes that could not be framed.
    FramingError,
    /// Raised by the embedding application.
    Local(i32),
}

impl ErrorCode {
    /// Numeric code for status reporting.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ControllerFault => 1,
            ErrorCode::ConnectionLost => 2,
            ErrorCode::NoConfig => 3,
            ErrorCode::FramingError => 4,
            ErrorCode::Local(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultReport {
    pub code: ErrorCode,
    pub report: String,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    StateChanged {
        from: OperatingState,
        to: OperatingState,
    },
    Fault(FaultReport),
    /// The controller started reporting fault.
    RemoteFault {
        error_code: u32,
    },
    Connection(ConnectionState),
    Telemetry(Sample<Telemetry>),
    Config(Sample<Config>),
}

/// Settings for a [`ControllerStateCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub link: LinkConfig,
    /// How long `connect()` waits for the controller to dial in.
    pub connection_timeout: Duration,
    /// How long `connect()` waits for config and then telemetry; also bounds
    /// each wait for a telemetry sample.
    pub config_timeout: Duration,
    /// Telemetry samples to wait for a commanded controller state.
    pub max_telemetry_samples: usize,
    /// Pause after powering the drives before enabling.
    pub drive_settle_time: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            connection_timeout: Duration::from_secs(10),
            config_timeout: Duration::from_secs(10),
            max_telemetry_samples: 5,
            drive_settle_time: Duration::from_secs(1),
        }
    }
}

struct Monitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: CoordinatorConfig,
    state: watch::Sender<OperatingState>,
    fault: StdMutex<Option<FaultReport>>,
    link: StdMutex<Option<TelemetryCommandLink>>,
    monitor: StdMutex<Option<Monitor>>,
    lifecycle: Mutex<()>,
    command_lock: Mutex<()>,
    events: broadcast::Sender<CoordinatorEvent>,
    remote_fault: AtomicBool,
}

/// Keeps the local operating state in step with the controller.
///
/// Owns the link while listening. Controller telemetry is authoritative: a
/// fault reported while enabled faults this side, and losing the enabled
/// state or command authority drops back to disabled. Commands are
/// serialised by a command lock so multi-command sequences never interleave.
#[derive(Clone)]
pub struct ControllerStateCoordinator {
    inner: Arc<Inner>,
}

impl ControllerStateCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (state, _) = watch::channel(OperatingState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                fault: StdMutex::new(None),
                link: StdMutex::new(None),
                monitor: StdMutex::new(None),
                lifecycle: Mutex::new(()),
                command_lock: Mutex::new(()),
                events,
                remote_fault: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> OperatingState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OperatingState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// The report of the current fault, if in [`OperatingState::Fault`].
    pub fn fault_report(&self) -> Option<FaultReport> {
        lock(&self.inner.fault).clone()
    }

    pub fn link(&self) -> Option<TelemetryCommandLink> {
        lock(&self.inner.link).clone()
    }

    /// True while a controller socket is connected.
    pub fn is_connected(&self) -> bool {
        self.link().is_some_and(|link| link.is_connected())
    }

    pub fn latest_telemetry(&self) -> Option<Sample<Telemetry>> {
        self.link().and_then(|link| link.latest_telemetry())
    }

    pub fn latest_config(&self) -> Option<Sample<Config>> {
        self.link().and_then(|link| link.latest_config())
    }

    /// Bind the listening socket if not already bound.
    ///
    /// Returns the address the controller should dial.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(link) = self.link() {
            return Ok(link.local_addr());
        }

        let link = TelemetryCommandLink::bind(self.inner.config.link.clone()).await?;
        let events = link.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor(Arc::clone(&self.inner), events, cancel.clone()));
        let addr = link.local_addr();

        *lock(&self.inner.link) = Some(link);
        *lock(&self.inner.monitor) = Some(Monitor { cancel, task });
        self.inner
            .transition(&[OperatingState::Disconnected], OperatingState::Connecting);
        info!(%addr, "waiting for controller");
        Ok(addr)
    }

    /// Listen, then wait for the controller to connect and send config and
    /// telemetry.
    ///
    /// Timing out faults with [`ErrorCode::ConnectionLost`] if the controller
    /// never connected, [`ErrorCode::NoConfig`] if it connected but stayed
    /// silent.
    pub async fn connect(&self) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            OperatingState::Disconnected | OperatingState::Connecting
        ) {
            return Err(PeerError::IllegalTransition {
                operation: "connect",
                state,
            });
        }

        self.listen().await?;
        let link = self.link().ok_or(PeerError::Closed)?;
        let config = &self.inner.config;

        let mut connection = link.subscribe_state();
        match tokio::time::timeout(
            config.connection_timeout,
            wait_for_state(&mut connection, ConnectionState::Connected),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(PeerError::Closed),
            Err(_) => {
                self.inner.fault(
                    ErrorCode::ConnectionLost,
                    format!(
                        "Timed out waiting for the controller to connect to port {}",
                        link.port()
                    ),
                );
                return Err(PeerError::ConnectTimeout(config.connection_timeout));
            }
        }

        match tokio::time::timeout(config.config_timeout, wait_for_config(&link)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                self.inner.fault(
                    ErrorCode::NoConfig,
                    format!(
                        "Timed out waiting for config from the controller on port {}",
                        link.port()
                    ),
                );
                return Err(PeerError::ConfigTimeout(config.config_timeout));
            }
        }

        self.inner.require_transition(
            "connect",
            &[OperatingState::Connecting],
            OperatingState::Disabled,
        )?;
        Ok(())
    }

    /// Enable the controller.
    ///
    /// Clears a controller fault first if one is reported, then powers the
    /// drives and commands the enabled state. If the controller does not
    /// follow, this side returns to [`OperatingState::Disabled`] and `enable`
    /// may be called again.
    pub async fn enable(&self) -> Result<()> {
        let state = self.state();
        if state != OperatingState::Disabled {
            return Err(PeerError::IllegalTransition {
                operation: "enable",
                state,
            });
        }
        let link = self.connected_link()?;
        require_commandable(&link)?;

        let _commands = self.inner.command_lock.lock().await;
        let result = self.enable_locked(&link).await;
        if let Err(err) = &result {
            if self.inner.transition(
                &[OperatingState::ClearingFault, OperatingState::Enabling],
                OperatingState::Disabled,
            ) {
                warn!(error = %err, "enable failed; staying disabled");
            }
        }
        result
    }

    async fn enable_locked(&self, link: &TelemetryCommandLink) -> Result<()> {
        let mut telemetry = link
            .latest_telemetry()
            .ok_or(PeerError::NotConnected)?
            .body;
        info!(controller_state = telemetry.state, "enabling controller");

        if telemetry.controller_state() == Some(ControllerState::Enabled) {
            return self.inner.require_transition(
                "enable",
                &[OperatingState::Disabled],
                OperatingState::Enabled,
            );
        }

        if telemetry.is_fault() {
            self.inner.require_transition(
                "enable",
                &[OperatingState::Disabled],
                OperatingState::ClearingFault,
            )?;
            info!(error_code = telemetry.error_code, "clearing controller fault");
            link.run_command(CommandCode::SetState, param1(SetStateParam::ClearError.as_param()))
                .await?;
            telemetry = self
                .wait_controller_state(link, ControllerState::Standby)
                .await?;
            self.inner.require_transition(
                "enable",
                &[OperatingState::ClearingFault],
                OperatingState::Enabling,
            )?;
        } else {
            self.inner.require_transition(
                "enable",
                &[OperatingState::Disabled],
                OperatingState::Enabling,
            )?;
        }

        if telemetry.controller_state() != Some(ControllerState::Standby) {
            return Err(PeerError::ControllerState {
                expected: ControllerState::Standby,
                actual: telemetry.controller_state(),
            });
        }

        link.run_command(CommandCode::EnableDrives, param1(1.0))
            .await?;
        tokio::time::sleep(self.inner.config.drive_settle_time).await;
        link.run_command(CommandCode::SetState, param1(SetStateParam::Enable.as_param()))
            .await?;
        self.wait_controller_state(link, ControllerState::Enabled)
            .await?;

        self.inner.require_transition(
            "enable",
            &[OperatingState::Enabling],
            OperatingState::Enabled,
        )
    }

    /// Wait up to `max_telemetry_samples` samples for `expected`.
    async fn wait_controller_state(
        &self,
        link: &TelemetryCommandLink,
        expected: ControllerState,
    ) -> Result<Telemetry> {
        let config = &self.inner.config;
        let mut actual = link.latest_telemetry().map(|sample| sample.body);
        if let Some(telemetry) = actual.filter(|t| t.controller_state() == Some(expected)) {
            return Ok(telemetry);
        }
        for _ in 0..config.max_telemetry_samples {
            let sample = tokio::time::timeout(config.config_timeout, link.next_telemetry(0))
                .await
                .map_err(|_| PeerError::ConfigTimeout(config.config_timeout))??;
            if sample.body.controller_state() == Some(expected) {
                return Ok(sample.body);
            }
            actual = Some(sample.body);
        }
        Err(PeerError::ControllerState {
            expected,
            actual: actual.and_then(|t| t.controller_state()),
        })
    }

    /// Put the controller in standby and power off the drives.
    ///
    /// Command failures are logged and ignored; this side ends up
    /// [`OperatingState::Disabled`] either way.
    pub async fn disable(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, OperatingState::Enabled | OperatingState::Disabled) {
            return Err(PeerError::IllegalTransition {
                operation: "disable",
                state,
            });
        }
        let link = self.connected_link()?;

        let _commands = self.inner.command_lock.lock().await;
        self.inner
            .transition(&[OperatingState::Enabled], OperatingState::Disabled);

        if let Err(err) = link
            .run_command(CommandCode::SetState, param1(SetStateParam::Standby.as_param()))
            .await
        {
            warn!(error = %err, "ignoring failure to put the controller in standby");
        }
        if let Err(err) = link.run_command(CommandCode::EnableDrives, param1(0.0)).await {
            warn!(error = %err, "ignoring failure to disable the drives");
        }
        Ok(())
    }

    /// Go to [`OperatingState::Fault`] with the given report.
    ///
    /// Ignored if already in fault.
    pub fn fault_locally(&self, code: ErrorCode, report: impl Into<String>) {
        self.inner.fault(code, report.into());
    }

    /// Leave [`OperatingState::Fault`].
    ///
    /// Goes to `Disabled` if the current connection has delivered config,
    /// `Connecting` if listening, `Disconnected` otherwise.
    pub async fn clear_fault(&self) -> Result<OperatingState> {
        let target = match self.link() {
            Some(link) => {
                let generation = link.generation().await;
                let configured = generation.is_some()
                    && link.latest_config().map(|c| c.generation) == generation
                    && link.latest_telemetry().map(|t| t.generation) == generation;
                if configured {
                    OperatingState::Disabled
                } else {
                    OperatingState::Connecting
                }
            }
            None => OperatingState::Disconnected,
        };

        self.inner
            .require_transition("clear fault", &[OperatingState::Fault], target)?;
        *lock(&self.inner.fault) = None;
        info!(state = %target, "fault cleared");
        Ok(target)
    }

    /// Close the link and return to [`OperatingState::Disconnected`].
    ///
    /// Legal from any state; pending commands fail with
    /// [`PeerError::ConnectionLost`].
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let monitor = lock(&self.inner.monitor).take();
        let link = lock(&self.inner.link).take();

        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            let _ = monitor.task.await;
        }
        if let Some(link) = link {
            link.close().await;
            self.inner.emit(CoordinatorEvent::Connection(
                ConnectionState::Disconnected,
            ));
        }

        *lock(&self.inner.fault) = None;
        self.inner.remote_fault.store(false, Ordering::Release);
        self.inner.set_state(OperatingState::Disconnected);
    }

    /// Send one command and wait for a successful status.
    pub async fn send_command(
        &self,
        code: impl Into<u32>,
        params: [f64; NUM_PARAMS],
    ) -> Result<CommandStatus> {
        let link = self.commandable_link("send command")?;
        let _commands = self.inner.command_lock.lock().await;
        link.run_command(code, params).await
    }

    /// Send several commands with no other command in between.
    ///
    /// Stops at the first failure. The counter and sync pattern of each
    /// command are assigned by the link.
    pub async fn run_multiple_commands(&self, commands: &[Command]) -> Result<Vec<CommandStatus>> {
        let link = self.commandable_link("send commands")?;
        let _commands = self.inner.command_lock.lock().await;
        let mut statuses = Vec::with_capacity(commands.len());
        for command in commands {
            statuses.push(link.run_command(command.code, command.params).await?);
        }
        Ok(statuses)
    }

    /// Wait for a fresh telemetry sample, skipping `skip` samples.
    pub async fn next_telemetry(&self, skip: usize) -> Result<Sample<Telemetry>> {
        let link = self.link().ok_or(PeerError::NotConnected)?;
        let samples = u32::try_from(skip)
            .ok()
            .and_then(|skip| skip.checked_add(1))
            .unwrap_or(u32::MAX);
        let timeout = self.inner.config.config_timeout.saturating_mul(samples);
        tokio::time::timeout(timeout, link.next_telemetry(skip))
            .await
            .map_err(|_| PeerError::ConfigTimeout(timeout))?
    }

    fn connected_link(&self) -> Result<TelemetryCommandLink> {
        self.link()
            .filter(|link| link.is_connected())
            .ok_or(PeerError::NotConnected)
    }

    fn commandable_link(&self, operation: &'static str) -> Result<TelemetryCommandLink> {
        let state = self.state();
        if !state.is_connected() && state != OperatingState::Fault {
            return Err(PeerError::IllegalTransition { operation, state });
        }
        let link = self.connected_link()?;
        require_commandable(&link)?;
        Ok(link)
    }
}

impl std::fmt::Debug for ControllerStateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerStateCoordinator")
            .field("state", &self.state())
            .field("link", &self.link())
            .finish()
    }
}

impl Inner {
    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    /// Move to `to` if the current state is one of `from`.
    ///
    /// Returns false, changing nothing, otherwise.
    fn transition(&self, from: &[OperatingState], to: OperatingState) -> bool {
        let mut allowed = false;
        let mut previous = to;
        self.state.send_if_modified(|state| {
            if !from.contains(state) {
                return false;
            }
            allowed = true;
            previous = *state;
            if *state == to {
                return false;
            }
            *state = to;
            true
        });
        if allowed && previous != to {
            info!(from = %previous, to = %to, "operating state changed");
            self.emit(CoordinatorEvent::StateChanged { from: previous, to });
        }
        allowed
    }

    fn require_transition(
        &self,
        operation: &'static str,
        from: &[OperatingState],
        to: OperatingState,
    ) -> Result<()> {
        if self.transition(from, to) {
            Ok(())
        } else {
            Err(PeerError::IllegalTransition {
                operation,
                state: *self.state.borrow(),
            })
        }
    }

    fn set_state(&self, to: OperatingState) {
        let previous = self.state.send_replace(to);
        if previous != to {
            info!(from = %previous, to = %to, "operating state changed");
            self.emit(CoordinatorEvent::StateChanged { from: previous, to });
        }
    }

    fn fault(&self, code: ErrorCode, report: String) {
        let fault = FaultReport { code, report };
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == OperatingState::Fault {
                return false;
            }
            previous = Some(*state);
            *lock(&self.fault) = Some(fault.clone());
            *state = OperatingState::Fault;
            true
        });

        let Some(previous) = previous else {
            debug!(code = code.code(), report = %fault.report, "already in fault");
            return;
        };
        error!(code = code.code(), report = %fault.report, "fault");
        self.emit(CoordinatorEvent::StateChanged {
            from: previous,
            to: OperatingState::Fault,
        });
        self.emit(CoordinatorEvent::Fault(fault));
    }

    fn on_telemetry(&self, telemetry: &Telemetry) {
        let faulted = telemetry.is_fault();
        let was_faulted = self.remote_fault.swap(faulted, Ordering::AcqRel);
        if faulted && !was_faulted {
            warn!(error_code = telemetry.error_code, "controller reports fault");
            self.emit(CoordinatorEvent::RemoteFault {
                error_code: telemetry.error_code,
            });
        }

        if *self.state.borrow() != OperatingState::Enabled {
            return;
        }

        if faulted {
            self.fault(
                ErrorCode::ControllerFault,
                format!(
                    "Low-level controller went to fault state (error code {})",
                    telemetry.error_code
                ),
            );
        } else if !telemetry.is_commandable() {
            warn!("disabling: the controller is being commanded by another source");
            self.transition(&[OperatingState::Enabled], OperatingState::Disabled);
        } else if telemetry.controller_state() != Some(ControllerState::Enabled) {
            warn!(
                controller_state = telemetry.state,
                "disabling: the controller left the enabled state"
            );
            self.transition(&[OperatingState::Enabled], OperatingState::Disabled);
        }
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        self.remote_fault.store(false, Ordering::Release);
        if !reason.is_unexpected() || !self.state.borrow().is_connected() {
            return;
        }
        let code = match reason {
            DisconnectReason::Framing(_) => ErrorCode::FramingError,
            _ => ErrorCode::ConnectionLost,
        };
        self.fault(
            code,
            format!("Lost connection to the low-level controller: {reason}"),
        );
    }

    /// Catch up after dropped link events.
    ///
    /// A connection that is gone or has been replaced since `tracked` came up
    /// was lost while the events were skipped.
    fn on_lagged(&self, tracked: Option<u64>, current: Option<u64>) {
        let Some(tracked) = tracked else {
            return;
        };
        if current == Some(tracked) {
            return;
        }
        let reason = DisconnectReason::Io(format!(
            "connection {tracked} ended while link events were dropped"
        ));
        self.on_disconnect(&reason);
    }
}

async fn monitor(
    inner: Arc<Inner>,
    mut events: broadcast::Receiver<LinkEvent>,
    cancel: CancellationToken,
) {
    // Generation of the connection the monitor last saw come up.
    let mut tracked = None;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(LinkEvent::Telemetry(sample)) => {
                inner.on_telemetry(&sample.body);
                inner.emit(CoordinatorEvent::Telemetry(sample));
            }
            Ok(LinkEvent::Config(sample)) => inner.emit(CoordinatorEvent::Config(sample)),
            Ok(LinkEvent::Connected { generation, .. }) => {
                tracked = Some(generation);
                inner.emit(CoordinatorEvent::Connection(ConnectionState::Connected));
            }
            Ok(LinkEvent::Disconnected { reason, .. }) => {
                tracked = None;
                inner.on_disconnect(&reason);
                inner.emit(CoordinatorEvent::Connection(ConnectionState::Connecting));
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "coordinator fell behind link events");
                let link = lock(&inner.link).clone();
                let current = match link {
                    Some(link) => link.generation().await,
                    None => None,
                };
                inner.on_lagged(tracked, current);
                tracked = current;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("coordinator monitor stopped");
}

/// Wait for config and then telemetry on one connection.
///
/// Starts over on the new connection if the controller drops and redials.
async fn wait_for_config(link: &TelemetryCommandLink) -> Result<()> {
    let mut connection = link.subscribe_state();
    let mut config = link.config_receiver();
    loop {
        wait_for_state(&mut connection, ConnectionState::Connected)
            .await
            .map_err(|_| PeerError::Closed)?;
        let Some(generation) = link.generation().await else {
            // Connection is being torn down.
            connection.changed().await.map_err(|_| PeerError::Closed)?;
            continue;
        };

        tokio::select! {
            configured = config.wait_for(|sample| {
                sample.is_some_and(|s| s.generation == generation)
            }) => {
                configured.map(|_| ()).map_err(|_| PeerError::Closed)?;
            }
            dropped = connection.wait_for(|state| *state != ConnectionState::Connected) => {
                dropped.map(|_| ()).map_err(|_| PeerError::Closed)?;
                debug!(generation, "controller dropped before sending config");
                continue;
            }
        }

        tokio::select! {
            telemetry = link.next_telemetry(0) => {
                let telemetry = telemetry?;
                if telemetry.generation != generation {
                    continue;
                }
                debug!(
                    generation,
                    controller_state = telemetry.body.state,
                    "controller configured"
                );
                return Ok(());
            }
            dropped = connection.wait_for(|state| *state != ConnectionState::Connected) => {
                dropped.map(|_| ()).map_err(|_| PeerError::Closed)?;
                debug!(generation, "controller dropped before sending telemetry");
            }
        }
    }
}

fn require_commandable(link: &TelemetryCommandLink) -> Result<()> {
    match link.latest_telemetry() {
        Some(sample) if sample.body.is_commandable() => Ok(()),
        Some(_) => Err(PeerError::NotCommandable),
        None => Err(PeerError::NotConnected),
    }
}

fn param1(value: f64) -> [f64; NUM_PARAMS] {
    let mut params = [0.0; NUM_PARAMS];
    params[0] = value;
    params
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CoordinatorConfig {
        CoordinatorConfig {
            connection_timeout: Duration::from_millis(100),
            config_timeout: Duration::from_millis(100),
            drive_settle_time: Duration::from_millis(1),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn enable_requires_disabled_state() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        let err = coordinator.enable().await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::IllegalTransition {
                operation: "enable",
                state: OperatingState::Disconnected
            }
        ));
        assert_eq!(coordinator.state(), OperatingState::Disconnected);
    }

    #[tokio::test]
    async fn connect_without_controller_faults_with_connection_lost() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        let mut events = coordinator.subscribe();

        let err = coordinator.connect().await.unwrap_err();
        assert!(matches!(err, PeerError::ConnectTimeout(_)));
        assert_eq!(coordinator.state(), OperatingState::Fault);
        assert_eq!(
            coordinator.fault_report().map(|f| f.code),
            Some(ErrorCode::ConnectionLost)
        );

        let mut saw_fault = false;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::Fault(report) = event {
                assert_eq!(report.code, ErrorCode::ConnectionLost);
                saw_fault = true;
            }
        }
        assert!(saw_fault);

        // Still listening, so clearing goes back to waiting for the controller.
        assert_eq!(
            coordinator.clear_fault().await.unwrap(),
            OperatingState::Connecting
        );
        coordinator.disconnect().await;
        assert_eq!(coordinator.state(), OperatingState::Disconnected);
    }

    #[tokio::test]
    async fn fault_locally_keeps_first_report() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        coordinator.fault_locally(ErrorCode::Local(42), "first");
        coordinator.fault_locally(ErrorCode::Local(7), "second");

        let report = coordinator.fault_report().unwrap();
        assert_eq!(report.code, ErrorCode::Local(42));
        assert_eq!(report.report, "first");

        assert_eq!(
            coordinator.clear_fault().await.unwrap(),
            OperatingState::Disconnected
        );
        assert!(coordinator.fault_report().is_none());
    }

    #[tokio::test]
    async fn clear_fault_outside_fault_is_illegal() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        let err = coordinator.clear_fault().await.unwrap_err();
        assert!(matches!(err, PeerError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn commands_need_a_connection() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        coordinator.listen().await.unwrap();
        assert_eq!(coordinator.state(), OperatingState::Connecting);

        let err = coordinator
            .send_command(CommandCode::Move, [0.0; NUM_PARAMS])
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::IllegalTransition { .. }));

        let err = coordinator.disable().await.unwrap_err();
        assert!(matches!(err, PeerError::IllegalTransition { .. }));
        coordinator.disconnect().await;
    }

    #[tokio::test]
    async fn next_telemetry_with_huge_skip_times_out_normally() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        coordinator.listen().await.unwrap();

        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.next_telemetry(usize::MAX),
        )
        .await;
        assert!(waited.is_err());
        coordinator.disconnect().await;
    }

    #[test]
    fn connection_replaced_during_lag_faults() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        let inner = &coordinator.inner;

        inner.set_state(OperatingState::Enabled);
        inner.on_lagged(Some(1), Some(1));
        assert_eq!(coordinator.state(), OperatingState::Enabled);
        inner.on_lagged(None, None);
        assert_eq!(coordinator.state(), OperatingState::Enabled);

        inner.on_lagged(Some(1), Some(2));
        assert_eq!(coordinator.state(), OperatingState::Fault);
        assert_eq!(
            coordinator.fault_report().map(|f| f.code),
            Some(ErrorCode::ConnectionLost)
        );
    }

    #[test]
    fn connection_gone_during_lag_faults_only_when_connected() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        let inner = &coordinator.inner;

        inner.set_state(OperatingState::Connecting);
        inner.on_lagged(Some(1), None);
        assert_eq!(coordinator.state(), OperatingState::Connecting);

        inner.set_state(OperatingState::Disabled);
        inner.on_lagged(Some(1), None);
        assert_eq!(coordinator.state(), OperatingState::Fault);
    }

    #[tokio::test]
    async fn listen_is_idempotent() {
        let coordinator = ControllerStateCoordinator::new(quick_config());
        let first = coordinator.listen().await.unwrap();
        let second = coordinator.listen().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port(), 0);
        coordinator.disconnect().await;
        coordinator.disconnect().await;
        assert!(coordinator.link().is_none());
    }

    #[test]
    fn error_codes_and_serialization() {
        assert_eq!(ErrorCode::ConnectionLost.code(), 2);
        assert_eq!(ErrorCode::Local(-3).code(), -3);

        let report = FaultReport {
            code: ErrorCode::NoConfig,
            report: "no config".to_string(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["code"], "no_config");
        assert_eq!(
            serde_json::to_value(OperatingState::ClearingFault).unwrap(),
            "clearing_fault"
        );
    }
}
