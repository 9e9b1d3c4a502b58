//! Frame ids carried in the inbound [`Header`](crate::Header).
//!
//! The set is closed and agreed with the controller firmware. Anything else on
//! the wire is a framing fault.

use crate::codec::WireRecord;
use crate::error::FrameError;
use crate::records::{CommandStatus, Config, Telemetry};

/// Discriminator selecting the body that follows a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameId {
    /// Reply to exactly one command.
    CommandStatus = 0x01,
    /// Periodic controller state sample.
    Telemetry = 0x05,
    /// Motion limits; sent on connect and whenever they change.
    Config = 0x19,
}

impl FrameId {
    /// Size in bytes of the body that follows the header.
    pub const fn body_size(self) -> usize {
        match self {
            FrameId::CommandStatus => CommandStatus::SIZE,
            FrameId::Telemetry => Telemetry::SIZE,
            FrameId::Config => Config::SIZE,
        }
    }

    /// Human-readable name for logs and CLI output.
    pub const fn name(self) -> &'static str {
        match self {
            FrameId::CommandStatus => "COMMAND_STATUS",
            FrameId::Telemetry => "TELEMETRY",
            FrameId::Config => "CONFIG",
        }
    }
}

impl From<FrameId> for u16 {
    fn from(id: FrameId) -> Self {
        id as u16
    }
}

impl TryFrom<u16> for FrameId {
    type Error = FrameError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        match raw {
            0x01 => Ok(FrameId::CommandStatus),
            0x05 => Ok(FrameId::Telemetry),
            0x19 => Ok(FrameId::Config),
            other => Err(FrameError::UnknownFrameId(other)),
        }
    }
}
