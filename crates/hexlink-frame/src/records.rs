//! Fixed-layout record bodies and the enumerations carried inside them.
//!
//! Enumerated fields are kept as raw integers in the records so every byte
//! pattern round-trips; typed accessors return `None` for values this side
//! does not know.

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::WireRecord;

/// Commander identifier stamped into every command sent by the supervisor.
pub const DEFAULT_COMMANDER_ID: u16 = 0x1234;

/// Number of `f64` parameters in a [`Command`].
pub const NUM_PARAMS: usize = 6;

macro_rules! wire_enum {
    ($name:ident : $raw:ty { $($variant:ident = $value:expr),+ $(,)? }) => {
        impl $name {
            /// Decode a raw wire value.
            pub fn from_raw(raw: $raw) -> Option<Self> {
                match raw {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Raw wire value.
            pub const fn raw(self) -> $raw {
                self as $raw
            }
        }

        impl From<$name> for $raw {
            fn from(value: $name) -> Self {
                value as $raw
            }
        }
    };
}

/// Command codes understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    /// State transition; `param1` is a [`SetStateParam`].
    SetState = 1,
    /// Power the drives; `param1` is 1.0 (on) or 0.0 (off).
    EnableDrives = 2,
    /// Point-to-point move; `param1` is the target position.
    Move = 3,
    /// Set the velocity limit; `param1` is the new limit.
    ConfigVelocity = 4,
}

wire_enum!(CommandCode: u32 {
    SetState = 1,
    EnableDrives = 2,
    Move = 3,
    ConfigVelocity = 4,
});

/// `param1` values for [`CommandCode::SetState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SetStateParam {
    Invalid = 0,
    Start = 1,
    Enable = 2,
    Standby = 3,
    Disable = 4,
    Exit = 5,
    ClearError = 6,
    EnterControl = 7,
}

wire_enum!(SetStateParam: u32 {
    Invalid = 0,
    Start = 1,
    Enable = 2,
    Standby = 3,
    Disable = 4,
    Exit = 5,
    ClearError = 6,
    EnterControl = 7,
});

impl SetStateParam {
    /// The controller carries this value in an `f64` parameter slot.
    pub fn as_param(self) -> f64 {
        f64::from(self.raw())
    }

    /// Decode from an `f64` parameter; non-integral values are rejected.
    pub fn from_param(param: f64) -> Option<Self> {
        if param.fract() != 0.0 || !(0.0..=f64::from(u32::MAX)).contains(&param) {
            return None;
        }
        Self::from_raw(param as u32)
    }
}

/// Controller state reported in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControllerState {
    Standby = 0,
    Disabled = 1,
    Enabled = 2,
    Offline = 3,
    Fault = 4,
}

wire_enum!(ControllerState: u32 {
    Standby = 0,
    Disabled = 1,
    Enabled = 2,
    Offline = 3,
    Fault = 4,
});

/// Substate reported while the controller is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EnabledSubstate {
    Stationary = 0,
    Moving = 1,
}

wire_enum!(EnabledSubstate: u32 {
    Stationary = 0,
    Moving = 1,
});

/// Outcome reported in a [`CommandStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandStatusCode {
    Ack = 1,
    NoAck = 2,
    Complete = 3,
    Failed = 4,
}

wire_enum!(CommandStatusCode: u32 {
    Ack = 1,
    NoAck = 2,
    Complete = 3,
    Failed = 4,
});

impl CommandStatusCode {
    /// True if the controller accepted the command.
    pub fn is_success(self) -> bool {
        matches!(self, CommandStatusCode::Ack | CommandStatusCode::Complete)
    }
}

/// Bits of [`Telemetry::application_status`].
pub mod application_status {
    /// The supervisor (not the engineering UI) is the command source.
    pub const COMMANDABLE: u32 = 0x0000_0001;
    /// Motor drives are powered.
    pub const DRIVES_ENABLED: u32 = 0x0000_0002;
}

/// Command sent to the controller.
///
/// Wire layout (58 bytes):
/// ```text
/// ┌──────────────┬─────────────┬──────────┬──────────────────────┐
/// │ sync (2B LE) │ counter     │ code     │ param1..param6       │
/// │ commander id │ (4B LE)     │ (4B LE)  │ (6 × 8B f64 LE)      │
/// └──────────────┴─────────────┴──────────┴──────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    /// Commander identifier; marks the command as supervisor-originated.
    pub sync_pattern: u16,
    /// Sequence number echoed back in the matching [`CommandStatus`].
    pub counter: u32,
    pub code: u32,
    pub params: [f64; NUM_PARAMS],
}

impl Command {
    /// Create a command with the default commander id and a zero counter.
    ///
    /// The counter is assigned by the link when the command is sent.
    pub fn new(code: impl Into<u32>, params: [f64; NUM_PARAMS]) -> Self {
        Self {
            sync_pattern: DEFAULT_COMMANDER_ID,
            counter: 0,
            code: code.into(),
            params,
        }
    }

    /// Shorthand for a command that only uses `param1`.
    pub fn with_param1(code: impl Into<u32>, param1: f64) -> Self {
        let mut params = [0.0; NUM_PARAMS];
        params[0] = param1;
        Self::new(code, params)
    }

    pub fn command_code(&self) -> Option<CommandCode> {
        CommandCode::from_raw(self.code)
    }

    pub fn param1(&self) -> f64 {
        self.params[0]
    }
}

impl WireRecord for Command {
    const SIZE: usize = 2 + 4 + 4 + 8 * NUM_PARAMS;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u16_le(self.sync_pattern);
        dst.put_u32_le(self.counter);
        dst.put_u32_le(self.code);
        for param in self.params {
            dst.put_f64_le(param);
        }
    }

    fn get<B: Buf>(src: &mut B) -> Self {
        let sync_pattern = src.get_u16_le();
        let counter = src.get_u32_le();
        let code = src.get_u32_le();
        let mut params = [0.0; NUM_PARAMS];
        for param in params.iter_mut() {
            *param = src.get_f64_le();
        }
        Self {
            sync_pattern,
            counter,
            code,
            params,
        }
    }
}

/// Controller reply to one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandStatus {
    /// Counter of the command this status answers.
    pub counter: u32,
    pub status: u32,
    /// Controller's estimate of how long the command takes (seconds).
    pub duration: f64,
}

impl CommandStatus {
    pub fn new(counter: u32, status: CommandStatusCode, duration: f64) -> Self {
        Self {
            counter,
            status: status.raw(),
            duration,
        }
    }

    pub fn status_code(&self) -> Option<CommandStatusCode> {
        CommandStatusCode::from_raw(self.status)
    }

    /// Unknown status codes count as failures.
    pub fn is_success(&self) -> bool {
        self.status_code().is_some_and(CommandStatusCode::is_success)
    }
}

impl WireRecord for CommandStatus {
    const SIZE: usize = 4 + 4 + 8;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.counter);
        dst.put_u32_le(self.status);
        dst.put_f64_le(self.duration);
    }

    fn get<B: Buf>(src: &mut B) -> Self {
        Self {
            counter: src.get_u32_le(),
            status: src.get_u32_le(),
            duration: src.get_f64_le(),
        }
    }
}

/// Motion limits published by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Config {
    pub min_position: f64,
    pub max_position: f64,
    pub max_velocity: f64,
}

impl WireRecord for Config {
    const SIZE: usize = 3 * 8;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_f64_le(self.min_position);
        dst.put_f64_le(self.max_position);
        dst.put_f64_le(self.max_velocity);
    }

    fn get<B: Buf>(src: &mut B) -> Self {
        Self {
            min_position: src.get_f64_le(),
            max_position: src.get_f64_le(),
            max_velocity: src.get_f64_le(),
        }
    }
}

/// Periodic controller state sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Telemetry {
    /// Sample time; the same instant as the enclosing header's timestamp.
    pub time: f64,
    /// See [`application_status`].
    pub application_status: u32,
    pub state: u32,
    pub enabled_substate: u32,
    pub offline_substate: u32,
    /// Controller-specific error code; 0 when healthy.
    pub error_code: u32,
    pub curr_position: f64,
    pub cmd_position: f64,
}

impl Telemetry {
    pub fn controller_state(&self) -> Option<ControllerState> {
        ControllerState::from_raw(self.state)
    }

    pub fn enabled_substate(&self) -> Option<EnabledSubstate> {
        EnabledSubstate::from_raw(self.enabled_substate)
    }

    pub fn is_fault(&self) -> bool {
        self.controller_state() == Some(ControllerState::Fault)
    }

    pub fn is_commandable(&self) -> bool {
        self.application_status & application_status::COMMANDABLE != 0
    }

    pub fn drives_enabled(&self) -> bool {
        self.application_status & application_status::DRIVES_ENABLED != 0
    }
}

impl WireRecord for Telemetry {
    const SIZE: usize = 8 + 5 * 4 + 2 * 8;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_f64_le(self.time);
        dst.put_u32_le(self.application_status);
        dst.put_u32_le(self.state);
        dst.put_u32_le(self.enabled_substate);
        dst.put_u32_le(self.offline_substate);
        dst.put_u32_le(self.error_code);
        dst.put_f64_le(self.curr_position);
        dst.put_f64_le(self.cmd_position);
    }

    fn get<B: Buf>(src: &mut B) -> Self {
        Self {
            time: src.get_f64_le(),
            application_status: src.get_u32_le(),
            state: src.get_u32_le(),
            enabled_substate: src.get_u32_le(),
            offline_substate: src.get_u32_le(),
            error_code: src.get_u32_le(),
            curr_position: src.get_f64_le(),
            cmd_position: src.get_f64_le(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_record, encode_record};

    #[test]
    fn record_sizes_match_wire_contract() {
        assert_eq!(Command::SIZE, 58);
        assert_eq!(CommandStatus::SIZE, 16);
        assert_eq!(Config::SIZE, 24);
        assert_eq!(Telemetry::SIZE, 44);
    }

    #[test]
    fn command_layout_is_packed_little_endian() {
        let mut cmd = Command::with_param1(CommandCode::SetState, 6.0);
        cmd.counter = 0x0102_0304;

        let mut buf = BytesMut::new();
        encode_record(&cmd, &mut buf);

        assert_eq!(buf.len(), Command::SIZE);
        assert_eq!(&buf[0..2], &[0x34, 0x12]);
        assert_eq!(&buf[2..6], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[6..10], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[10..18], &6.0f64.to_le_bytes());
        assert!(buf[18..].iter().all(|b| *b == 0));
    }

    #[test]
    fn telemetry_roundtrip_preserves_unknown_state() {
        let telemetry = Telemetry {
            time: 1_700_000_000.25,
            application_status: application_status::COMMANDABLE,
            state: 99,
            enabled_substate: 1,
            offline_substate: 0,
            error_code: 17,
            curr_position: -1.5,
            cmd_position: 2.0,
        };

        let mut buf = BytesMut::new();
        encode_record(&telemetry, &mut buf);
        let decoded: Telemetry = decode_record(&buf).unwrap();

        assert_eq!(decoded, telemetry);
        assert_eq!(decoded.controller_state(), None);
        assert_eq!(decoded.enabled_substate(), Some(EnabledSubstate::Moving));
        assert!(decoded.is_commandable());
        assert!(!decoded.drives_enabled());
    }

    #[test]
    fn nan_parameters_roundtrip_bit_exact() {
        let mut cmd = Command::new(CommandCode::Move, [f64::NAN, 1.0, 2.0, 3.0, 4.0, 5.0]);
        cmd.counter = 9;

        let mut first = BytesMut::new();
        encode_record(&cmd, &mut first);
        let decoded: Command = decode_record(&first).unwrap();
        let mut second = BytesMut::new();
        encode_record(&decoded, &mut second);

        assert_eq!(first, second);
    }

    #[test]
    fn status_code_success() {
        assert!(CommandStatus::new(1, CommandStatusCode::Ack, 0.0).is_success());
        assert!(CommandStatus::new(1, CommandStatusCode::Complete, 0.0).is_success());
        assert!(!CommandStatus::new(1, CommandStatusCode::NoAck, 0.0).is_success());
        assert!(!CommandStatus::new(1, CommandStatusCode::Failed, 0.0).is_success());

        let unknown = CommandStatus {
            counter: 1,
            status: 42,
            duration: 0.0,
        };
        assert!(!unknown.is_success());
    }

    #[test]
    fn set_state_param_from_float() {
        assert_eq!(
            SetStateParam::from_param(6.0),
            Some(SetStateParam::ClearError)
        );
        assert_eq!(SetStateParam::from_param(2.5), None);
        assert_eq!(SetStateParam::from_param(-1.0), None);
        assert_eq!(SetStateParam::from_param(100.0), None);
        assert_eq!(SetStateParam::Enable.as_param(), 2.0);
    }

    #[test]
    fn command_code_lookup() {
        let cmd = Command::with_param1(CommandCode::EnableDrives, 1.0);
        assert_eq!(cmd.command_code(), Some(CommandCode::EnableDrives));
        assert_eq!(cmd.sync_pattern, DEFAULT_COMMANDER_ID);

        let unknown = Command::with_param1(77u32, 0.0);
        assert_eq!(unknown.command_code(), None);
    }
}
