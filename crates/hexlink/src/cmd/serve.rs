use std::time::Duration;

use hexlink_frame::DEFAULT_COMMANDER_ID;
use hexlink_peer::{ControllerStateCoordinator, CoordinatorConfig, CoordinatorEvent, LinkConfig};
use hexlink_transport::AcceptorConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cmd::{resolve_duration, Endpoint, ServeArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_config, print_state_change, print_telemetry, OutputFormat};
use crate::settings::Settings;

pub async fn run(args: ServeArgs, settings: &Settings, format: OutputFormat) -> CliResult<i32> {
    let config = coordinator_config(&args, settings)?;
    let coordinator = ControllerStateCoordinator::new(config);
    let mut events = coordinator.subscribe();

    let addr = coordinator
        .listen()
        .await
        .map_err(|err| peer_error("bind failed", err))?;
    info!(%addr, "listening for controller");

    let result = serve(&coordinator, &mut events, &args, format).await;
    coordinator.disconnect().await;
    result
}

fn coordinator_config(args: &ServeArgs, settings: &Settings) -> CliResult<CoordinatorConfig> {
    let defaults = CoordinatorConfig::default();
    let endpoint = Endpoint::resolve(args.host.as_deref(), args.port, settings);
    let connection_timeout = resolve_duration(
        args.connection_timeout.as_deref(),
        settings.connection_timeout.as_deref(),
        defaults.connection_timeout,
    )?;
    let ack_timeout = resolve_duration(
        args.ack_timeout.as_deref(),
        settings.ack_timeout.as_deref(),
        Duration::from_secs(5),
    )?;

    Ok(CoordinatorConfig {
        link: LinkConfig {
            acceptor: AcceptorConfig::new(endpoint.host, endpoint.port),
            commander_id: args
                .commander_id
                .or(settings.commander_id)
                .unwrap_or(DEFAULT_COMMANDER_ID),
            ack_timeout,
            ..LinkConfig::default()
        },
        connection_timeout,
        ..defaults
    })
}

async fn serve(
    coordinator: &ControllerStateCoordinator,
    events: &mut tokio::sync::broadcast::Receiver<CoordinatorEvent>,
    args: &ServeArgs,
    format: OutputFormat,
) -> CliResult<i32> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tokio::select! {
        _ = &mut shutdown => return Ok(SUCCESS),
        result = coordinator.connect() => {
            result.map_err(|err| peer_error("connect failed", err))?;
        }
    }

    if args.enable {
        tokio::select! {
            _ = &mut shutdown => return Ok(SUCCESS),
            result = coordinator.enable() => {
                result.map_err(|err| peer_error("enable failed", err))?;
            }
        }
    }

    let mut printed = 0usize;
    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => event,
        };
        match event {
            Ok(CoordinatorEvent::Telemetry(sample)) => {
                print_telemetry(&sample, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            Ok(CoordinatorEvent::Config(sample)) => print_config(&sample, format),
            Ok(CoordinatorEvent::StateChanged { from, to }) => {
                print_state_change(from, to, format);
            }
            Ok(CoordinatorEvent::Fault(_))
            | Ok(CoordinatorEvent::RemoteFault { .. })
            | Ok(CoordinatorEvent::Connection(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "output fell behind; samples dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }

    Ok(SUCCESS)
}
