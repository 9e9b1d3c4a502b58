use hexlink_frame::DEFAULT_COMMANDER_ID;
use hexlink_peer::{MockConfig, MockPeer};
use hexlink_transport::{wait_for_state, ConnectionMonitor, ConnectionState};
use tracing::info;

use crate::cmd::{Endpoint, MockArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::settings::{parse_duration, Settings};

pub async fn run(args: MockArgs, settings: &Settings) -> CliResult<i32> {
    let endpoint = Endpoint::resolve(args.host.as_deref(), args.port, settings);
    let telemetry_interval = parse_duration(&args.telemetry_interval)?;
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;

    let config = MockConfig {
        telemetry_interval,
        commander_id: args
            .commander_id
            .or(settings.commander_id)
            .unwrap_or(DEFAULT_COMMANDER_ID),
        reconnect: !args.no_reconnect,
        ..MockConfig::new(endpoint.host.clone(), endpoint.port)
    };
    let peer = MockPeer::start(config);
    info!(host = %endpoint.host, port = endpoint.port, "mock controller dialing");

    let mut state = peer.subscribe_state();
    let stopped = wait_for_state(&mut state, ConnectionState::Disconnected);
    let elapsed = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = stopped => info!("connection ended"),
        _ = elapsed => {}
    }

    peer.close().await;
    Ok(SUCCESS)
}
