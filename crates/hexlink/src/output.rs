use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use hexlink_frame::{Config, ControllerState, EnabledSubstate, Telemetry};
use hexlink_peer::{OperatingState, Sample};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct TelemetryOutput {
    kind: &'static str,
    generation: u64,
    index: u64,
    time: f64,
    state: &'static str,
    enabled_substate: &'static str,
    commandable: bool,
    drives_enabled: bool,
    error_code: u32,
    curr_position: f64,
    cmd_position: f64,
}

impl From<&Sample<Telemetry>> for TelemetryOutput {
    fn from(sample: &Sample<Telemetry>) -> Self {
        let body = &sample.body;
        Self {
            kind: "telemetry",
            generation: sample.generation,
            index: sample.index,
            time: body.time,
            state: controller_state_name(body.state),
            enabled_substate: match body.enabled_substate() {
                Some(EnabledSubstate::Stationary) => "stationary",
                Some(EnabledSubstate::Moving) => "moving",
                None => "unknown",
            },
            commandable: body.is_commandable(),
            drives_enabled: body.drives_enabled(),
            error_code: body.error_code,
            curr_position: body.curr_position,
            cmd_position: body.cmd_position,
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct ConfigOutput {
    kind: &'static str,
    generation: u64,
    index: u64,
    timestamp: f64,
    min_position: f64,
    max_position: f64,
    max_velocity: f64,
}

impl From<&Sample<Config>> for ConfigOutput {
    fn from(sample: &Sample<Config>) -> Self {
        Self {
            kind: "config",
            generation: sample.generation,
            index: sample.index,
            timestamp: sample.header.timestamp.as_secs_f64(),
            min_position: sample.body.min_position,
            max_position: sample.body.max_position,
            max_velocity: sample.body.max_velocity,
        }
    }
}

#[derive(Serialize)]
struct StateOutput {
    kind: &'static str,
    from: OperatingState,
    to: OperatingState,
}

pub fn print_telemetry(sample: &Sample<Telemetry>, format: OutputFormat) {
    let out = TelemetryOutput::from(sample);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["GEN", "TIME", "STATE", "CMD", "POSITION", "TARGET", "ERROR"])
                .add_row(vec![
                    out.generation.to_string(),
                    format!("{:.3}", out.time),
                    out.state.to_string(),
                    out.commandable.to_string(),
                    format!("{:.4}", out.curr_position),
                    format!("{:.4}", out.cmd_position),
                    out.error_code.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "telemetry gen={} time={:.3} state={} commandable={} drives={} position={:.4} target={:.4} error={}",
                out.generation,
                out.time,
                out.state,
                out.commandable,
                out.drives_enabled,
                out.curr_position,
                out.cmd_position,
                out.error_code
            );
        }
    }
}

pub fn print_config(sample: &Sample<Config>, format: OutputFormat) {
    let out = ConfigOutput::from(sample);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["GEN", "MIN POSITION", "MAX POSITION", "MAX VELOCITY"])
                .add_row(vec![
                    out.generation.to_string(),
                    out.min_position.to_string(),
                    out.max_position.to_string(),
                    out.max_velocity.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "config gen={} min_position={} max_position={} max_velocity={}",
                out.generation, out.min_position, out.max_position, out.max_velocity
            );
        }
    }
}

pub fn print_state_change(from: OperatingState, to: OperatingState, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&StateOutput {
            kind: "state",
            from,
            to,
        }),
        OutputFormat::Table | OutputFormat::Pretty => println!("state {from} -> {to}"),
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn controller_state_name(raw: u32) -> &'static str {
    match ControllerState::from_raw(raw) {
        Some(ControllerState::Standby) => "standby",
        Some(ControllerState::Disabled) => "disabled",
        Some(ControllerState::Enabled) => "enabled",
        Some(ControllerState::Offline) => "offline",
        Some(ControllerState::Fault) => "fault",
        None => "unknown",
    }
}
