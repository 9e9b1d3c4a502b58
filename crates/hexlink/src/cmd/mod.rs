use std::future::Future;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{io_error, CliResult};
use crate::output::OutputFormat;
use crate::settings::{parse_duration, Settings};

pub mod mock;
pub mod serve;
pub mod version;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Wait for the controller, connect and print its telemetry.
    Serve(ServeArgs),
    /// Run a simulated controller that dials a supervisor.
    Mock(MockArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, settings: Settings, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args, &settings, format)),
        Command::Mock(args) => block_on(mock::run(args, &settings)),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F: Future<Output = CliResult<i32>>>(future: F) -> CliResult<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start runtime", err))?;
    runtime.block_on(future)
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long)]
    pub host: Option<String>,
    /// Port to listen on.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
    /// How long to wait for the controller to connect (e.g. 10s, 500ms).
    #[arg(long)]
    pub connection_timeout: Option<String>,
    /// How long to wait for each command status.
    #[arg(long)]
    pub ack_timeout: Option<String>,
    /// Commander id stamped into every command (decimal or 0x-prefixed hex).
    #[arg(long, value_parser = parse_commander_id)]
    pub commander_id: Option<u16>,
    /// Enable the controller once connected.
    #[arg(long)]
    pub enable: bool,
    /// Exit after printing N telemetry samples.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct MockArgs {
    /// Supervisor host to dial.
    #[arg(long)]
    pub host: Option<String>,
    /// Supervisor port to dial.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
    /// Telemetry cadence.
    #[arg(long, default_value = "100ms")]
    pub telemetry_interval: String,
    /// Commander id to accept commands from.
    #[arg(long, value_parser = parse_commander_id)]
    pub commander_id: Option<u16>,
    /// Exit when the first connection ends instead of dialing again.
    #[arg(long)]
    pub no_reconnect: bool,
    /// Exit after this long.
    #[arg(long)]
    pub duration: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Where to listen or dial, flags first, then settings, then defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn resolve(host: Option<&str>, port: Option<u16>, settings: &Settings) -> Self {
        Self {
            host: host
                .or(settings.host.as_deref())
                .unwrap_or(DEFAULT_HOST)
                .to_string(),
            port: port.or(settings.port).unwrap_or(DEFAULT_PORT),
        }
    }
}

/// Resolve a duration flag against its settings value and default.
pub fn resolve_duration(
    flag: Option<&str>,
    setting: Option<&str>,
    default: Duration,
) -> CliResult<Duration> {
    match flag.or(setting) {
        Some(value) => parse_duration(value),
        None => Ok(default),
    }
}

fn parse_commander_id(input: &str) -> Result<u16, String> {
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|err| format!("invalid commander id {input:?}: {err}"))
}
